//! Caller stub: resolve a service, run the rendezvous, return the reply.
//!
//! One call is one connection. The stub provisions a request segment,
//! announces it with REQUEST, waits for READY and then DONE, and reads
//! the reply out of whichever segment DONE names (the request segment,
//! reused, or a fresh one the server grew into).
//!
//! Unlink discipline: the caller created the request segment, so the
//! caller unlinks it; and because the caller is the last reader of a
//! server-created reply segment, the caller unlinks that one too.

use std::io;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use crate::registry;
use crate::segment::{self, Segment, SegmentError, HEADER_LEN};

/// Smallest request segment the caller provisions. The slack lets the
/// server reuse the segment for replies somewhat larger than the request.
pub const MIN_SEGMENT_CAPACITY: usize = 64 * 1024;

/// How long to wait between connect attempts against an absent socket.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Tunables for a [`ServiceCaller`].
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Deadline for reaching the service socket. Connects against a
    /// missing or refusing socket are retried until it passes, covering
    /// servers that are still starting up.
    pub connect_timeout: Duration,
    /// Optional deadline for the whole call, handler time included. On
    /// expiry the connection is dropped and the server abandons the call.
    pub call_timeout: Option<Duration>,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            call_timeout: None,
        }
    }
}

/// Client-side stub for one named service.
///
/// The stub is cheap and connectionless; every [`call`](Self::call) opens
/// its own connection and closes it again, so a stub can be held for the
/// life of the program.
pub struct ServiceCaller {
    service: String,
    config: CallerConfig,
}

impl ServiceCaller {
    /// Create a stub for `service` with default tunables.
    ///
    /// Fails with [`Error::Protocol`] if the name is invalid; nothing is
    /// created on the filesystem.
    pub fn new(service: &str) -> Result<Self> {
        Self::with_config(service, CallerConfig::default())
    }

    /// Create a stub with explicit tunables.
    pub fn with_config(service: &str, config: CallerConfig) -> Result<Self> {
        registry::validate_service_name(service)?;
        Ok(Self {
            service: service.to_owned(),
            config,
        })
    }

    /// The service this stub talks to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send `request` to the service and return the reply bytes.
    ///
    /// Errors are not retried; every failure reaches the caller:
    /// [`Error::NotFound`] when no server answers, [`Error::Remote`] when
    /// the handler failed, [`Error::Transport`] for I/O trouble before
    /// DONE, [`Error::Protocol`] for wire violations.
    pub async fn call(&self, request: &[u8]) -> Result<Vec<u8>> {
        match self.config.call_timeout {
            Some(limit) => match timeout(limit, self.call_inner(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("call to '{}' exceeded {limit:?}", self.service),
                ))),
            },
            None => self.call_inner(request).await,
        }
    }

    async fn call_inner(&self, request: &[u8]) -> Result<Vec<u8>> {
        let capacity = (HEADER_LEN + request.len()).max(MIN_SEGMENT_CAPACITY);
        let mut guard = UnlinkGuard(segment::create_for_service(&self.service, capacity)?);
        guard.0.write_payload(request)?;

        // The guard unlinks on every exit path, including this future
        // being dropped by a call timeout mid-exchange. On success the
        // server has already mapped and finished with the segment; on
        // failure nobody else will.
        self.exchange(&guard.0).await
    }

    /// Run the REQUEST/READY/DONE rendezvous over a fresh connection.
    async fn exchange(&self, request_segment: &Segment) -> Result<Vec<u8>> {
        let mut stream = self.connect().await?;

        frame::write_frame(
            &mut stream,
            &Frame::Request {
                shm_name: request_segment.name().to_owned(),
                capacity: request_segment.capacity() as u64,
            },
        )
        .await?;

        match frame::read_frame(&mut stream).await? {
            Frame::Ready => {}
            Frame::Error { message } => return Err(Error::Remote(message)),
            other => return Err(unexpected_frame("READY", &other)),
        }

        let (reply_name, _reply_capacity) = match frame::read_frame(&mut stream).await? {
            Frame::Done { shm_name, capacity } => (shm_name, capacity),
            Frame::Error { message } => return Err(Error::Remote(message)),
            other => return Err(unexpected_frame("DONE", &other)),
        };

        if reply_name == request_segment.name() {
            // Reply fit the request segment; our caller unlinks it.
            return Ok(request_segment.read_payload()?);
        }

        // The server grew into a fresh segment. The caller is its last
        // reader, so the caller unlinks it; the guard covers early
        // returns and cancellation alike.
        let reply_segment = match Segment::open(&reply_name) {
            Ok(segment) => UnlinkGuard(segment),
            Err(SegmentError::NotFound) => {
                return Err(Error::Protocol(format!(
                    "DONE names segment '{reply_name}' which does not exist"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(reply_segment.0.read_payload()?)
    }

    /// Connect to the service socket, knocking until the configured
    /// deadline passes.
    async fn connect(&self) -> Result<UnixStream> {
        let path = registry::socket_path(&self.service);
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => return Ok(stream),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    // Either the server has not bound yet or a dead one
                    // left its socket file behind. Both may resolve.
                    if Instant::now() >= deadline {
                        return Err(Error::NotFound(self.service.clone()));
                    }
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(Error::Transport(err)),
            }
        }
    }
}

/// Unlinks the wrapped segment's name on drop. The mapping itself goes
/// away with the segment.
struct UnlinkGuard(Segment);

impl Drop for UnlinkGuard {
    fn drop(&mut self) {
        self.0.unlink();
    }
}

impl std::fmt::Debug for ServiceCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCaller")
            .field("service", &self.service)
            .field("config", &self.config)
            .finish()
    }
}

fn unexpected_frame(expected: &str, got: &Frame) -> Error {
    Error::Protocol(format!("expected {expected}, got {}", got.tag_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_service_names() {
        assert!(matches!(
            ServiceCaller::new("no/slashes"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(ServiceCaller::new(""), Err(Error::Protocol(_))));
    }

    #[test]
    fn accepts_max_length_name() {
        let name = "n".repeat(registry::MAX_SERVICE_NAME_LEN);
        assert!(ServiceCaller::new(&name).is_ok());
        let over = "n".repeat(registry::MAX_SERVICE_NAME_LEN + 1);
        assert!(matches!(
            ServiceCaller::new(&over),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn absent_service_times_out_with_not_found() {
        let caller = ServiceCaller::with_config(
            "caller-test-absent",
            CallerConfig {
                connect_timeout: Duration::from_millis(60),
                call_timeout: None,
            },
        )
        .unwrap();
        let started = std::time::Instant::now();
        match caller.call(b"ping").await {
            Err(Error::NotFound(name)) => assert_eq!(name, "caller-test-absent"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
