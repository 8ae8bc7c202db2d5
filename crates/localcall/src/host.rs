//! Service host: accepts control connections and dispatches handlers.
//!
//! One host multiplexes any number of registered services on a single
//! cooperative loop. Connections are served strictly one at a time; at
//! most one handler runs per host. Handlers are expected to be CPU-bound
//! over large payloads, so the transport makes no attempt to overlap
//! them.
//!
//! Per-connection life cycle:
//!
//! ```text
//! AWAIT_REQUEST ──► AWAIT_USER_HANDOFF ──► EXECUTING ──► DONE_SENT ──► CLOSED
//!       │                   │                  │             │
//!       └───────────────────┴──────────────────┴─────────────┴──► ERROR ──► CLOSED
//! ```

use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::frame::{self, Frame, FrameError};
use crate::registry;
use crate::segment::{self, Segment, SegmentError, HEADER_LEN};

/// How often the dispatch loop re-collects its listener set, so services
/// registered while the loop is parked are picked up.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A user-supplied request handler: request bytes in, reply bytes or a
/// user-facing error message out.
///
/// Blanket-implemented for closures, so
/// `|req: &[u8]| -> Result<Vec<u8>, String> { Ok(req.to_vec()) }`
/// registers directly. Panics inside a handler are caught at the
/// dispatch boundary and reported to the caller as an ERROR frame.
pub trait Handler: Send + Sync + 'static {
    /// Process one request.
    fn handle(&self, request: &[u8]) -> std::result::Result<Vec<u8>, String>;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> std::result::Result<Vec<u8>, String> {
        self(request)
    }
}

struct Service {
    name: String,
    path: PathBuf,
    listener: UnixListener,
    handler: Arc<dyn Handler>,
}

impl Drop for Service {
    fn drop(&mut self) {
        // The listener's fd closes itself; the socket file does not.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(service = %self.name, "could not unlink socket: {err}");
            }
        }
    }
}

/// Server side of the transport.
///
/// Registration binds a listening socket per service; the `run_*` methods
/// drive the shared dispatch loop. Dropping the host closes every
/// listener and unlinks every socket file.
pub struct ServiceHost {
    services: Mutex<Vec<Service>>,
    /// Rotates the accept scan so one busy service cannot starve others.
    scan_from: AtomicUsize,
}

impl ServiceHost {
    /// A host with no services registered.
    pub fn new() -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            scan_from: AtomicUsize::new(0),
        }
    }

    /// Bind a listener for `name` and install `handler`.
    ///
    /// A stale socket file left by a dead server is unlinked and taken
    /// over; a live server answering on the path means the name is owned
    /// elsewhere and registration fails with [`Error::AddressInUse`].
    ///
    /// Must be called from within a tokio runtime (the listener registers
    /// with the runtime's reactor).
    pub fn register<H: Handler>(&self, name: &str, handler: H) -> Result<()> {
        registry::validate_service_name(name)?;

        let mut services = self.services.lock();
        if services.iter().any(|s| s.name == name) {
            return Err(Error::AddressInUse(name.to_owned()));
        }

        let path = registry::socket_path(name);
        if path.exists() {
            // Probe the path: a live owner accepts the connect, a stale
            // file from a dead process refuses it.
            match std::os::unix::net::UnixStream::connect(&path) {
                Ok(_) => return Err(Error::AddressInUse(name.to_owned())),
                Err(_) => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        if err.kind() != io::ErrorKind::NotFound {
                            return Err(Error::Transport(err));
                        }
                    }
                    tracing::debug!(service = name, "removed stale socket file");
                }
            }
        }

        let listener = UnixListener::bind(&path).map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(name.to_owned()),
            _ => Error::Transport(err),
        })?;

        // Owner-only access; the socket is the whole trust boundary.
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)) {
            drop(listener);
            let _ = std::fs::remove_file(&path);
            return Err(Error::Transport(err));
        }

        tracing::debug!(service = name, path = %path.display(), "service registered");
        services.push(Service {
            name: name.to_owned(),
            path,
            listener,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Close the listener for `name` and unlink its socket file.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut services = self.services.lock();
        match services.iter().position(|s| s.name == name) {
            Some(idx) => {
                // Dropping the entry closes the listener and removes the
                // socket file.
                services.remove(idx);
                Ok(())
            }
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    /// Registered service names, in registration order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.lock().iter().map(|s| s.name.clone()).collect()
    }

    /// Wait up to `timeout` for a connection on any registered service,
    /// handle at most one call, and report whether one was handled.
    ///
    /// Fails immediately if no service is registered.
    pub async fn run_one(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(Ok((stream, service, handler))) => {
                self.serve_connection(stream, &service, handler.as_ref()).await;
                Ok(true)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Serve until the future is dropped or an accept-level error occurs.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            self.run_one(ACCEPT_POLL_INTERVAL).await?;
        }
    }

    /// Readiness-multiplex all listeners and take the first pending
    /// connection.
    async fn accept(&self) -> Result<(UnixStream, String, Arc<dyn Handler>)> {
        std::future::poll_fn(|cx| {
            let services = self.services.lock();
            if services.is_empty() {
                return Poll::Ready(Err(Error::Transport(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no services registered",
                ))));
            }
            let start = self.scan_from.fetch_add(1, Ordering::Relaxed) % services.len();
            for i in 0..services.len() {
                let svc = &services[(start + i) % services.len()];
                match svc.listener.poll_accept(cx) {
                    Poll::Ready(Ok((stream, _addr))) => {
                        return Poll::Ready(Ok((stream, svc.name.clone(), svc.handler.clone())));
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(Error::Transport(err))),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Drive one connection to completion. Failures are logged, never
    /// propagated: one bad caller must not take the dispatch loop down.
    async fn serve_connection(&self, mut stream: UnixStream, service: &str, handler: &dyn Handler) {
        match serve_call(&mut stream, service, handler).await {
            Ok(()) => tracing::debug!(service, "call served"),
            // A probe or an impatient caller dropping the connection is
            // routine, not noteworthy.
            Err(Error::Transport(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(service, "caller went away: {err}");
            }
            Err(err) => tracing::warn!(service, "connection aborted: {err}"),
        }
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-connection algorithm: one REQUEST in, one DONE (or ERROR) out.
async fn serve_call(
    stream: &mut UnixStream,
    service: &str,
    handler: &dyn Handler,
) -> Result<()> {
    // AWAIT_REQUEST
    let shm_name = match frame::read_frame(stream).await {
        Ok(Frame::Request { shm_name, .. }) => shm_name,
        Ok(other) => {
            let message = format!("expected REQUEST, got {}", other.tag_name());
            let _ = send_error(stream, &message).await;
            return Err(Error::Protocol(message));
        }
        Err(FrameError::Malformed(msg)) => {
            let _ = send_error(stream, &format!("bad request: {msg}")).await;
            return Err(Error::Protocol(msg));
        }
        Err(err) => return Err(err.into()),
    };

    // AWAIT_USER_HANDOFF: copy the request out of the caller's segment.
    let mut request_segment = match Segment::open(&shm_name) {
        Ok(segment) => segment,
        Err(SegmentError::NotFound) => {
            let _ = send_error(stream, "request segment does not exist").await;
            return Err(Error::Protocol(format!(
                "REQUEST names absent segment '{shm_name}'"
            )));
        }
        Err(err) => {
            let _ = send_error(stream, "request segment could not be mapped").await;
            return Err(err.into());
        }
    };
    let request = match request_segment.read_payload() {
        Ok(request) => request,
        Err(err) => {
            let _ = send_error(stream, "corrupt request segment").await;
            return Err(err.into());
        }
    };

    frame::write_frame(stream, &Frame::Ready).await?;

    // EXECUTING
    let reply = match run_handler(handler, &request) {
        Ok(reply) => reply,
        Err(message) => {
            // The caller unlinks its request segment when it sees the
            // ERROR; unlinking here as well covers a caller that died in
            // the meantime. Unlink is idempotent.
            request_segment.unlink();
            send_error(stream, &message).await?;
            return Ok(());
        }
    };

    // Reuse the request segment when the reply fits, otherwise grow into
    // a fresh one. Either way the caller unlinks whatever DONE names.
    if reply.len() <= request_segment.payload_capacity() {
        request_segment.write_payload(&reply)?;
        frame::write_frame(
            stream,
            &Frame::Done {
                shm_name: request_segment.name().to_owned(),
                capacity: request_segment.capacity() as u64,
            },
        )
        .await?;
    } else {
        let capacity = segment::page_aligned(HEADER_LEN + reply.len());
        let mut reply_segment = segment::create_for_service(service, capacity)?;
        if let Err(err) = reply_segment.write_payload(&reply) {
            reply_segment.unlink();
            let _ = send_error(stream, "reply segment could not be written").await;
            return Err(err.into());
        }
        let done = Frame::Done {
            shm_name: reply_segment.name().to_owned(),
            capacity: reply_segment.capacity() as u64,
        };
        if let Err(err) = frame::write_frame(stream, &done).await {
            // The caller never learned this name, so nobody else can
            // unlink it.
            reply_segment.unlink();
            return Err(err.into());
        }
    }

    Ok(())
}

/// Invoke the handler, translating panics into error strings so they
/// become ERROR frames instead of tearing down the dispatch loop.
fn run_handler(handler: &dyn Handler, request: &[u8]) -> std::result::Result<Vec<u8>, String> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

async fn send_error(stream: &mut UnixStream, message: &str) -> Result<()> {
    frame::write_frame(
        stream,
        &Frame::Error {
            message: message.to_owned(),
        },
    )
    .await?;
    Ok(())
}
