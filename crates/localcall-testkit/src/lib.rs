//! localcall-testkit: shared end-to-end scenarios for the transport.
//!
//! Each scenario spins up a real endpoint on a uniquely named service,
//! drives one or more callers against it over real sockets and shared
//! memory, and checks the transport's contract: byte-for-byte fidelity,
//! shm namespace cleanup, and error propagation.
//!
//! # Usage
//!
//! ```ignore
//! #[tokio::test]
//! async fn identity_hello() {
//!     localcall_testkit::run_identity_roundtrip(b"hello").await;
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use localcall::{CallerConfig, Endpoint, Error, Handler, ServiceCaller};

static SERVICE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A service name no other test in this process is using.
pub fn unique_service_name(label: &str) -> String {
    let seq = SERVICE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("tk-{label}-{}-{seq}", std::process::id())
}

/// Count shm objects still linked for `service`. Linux surfaces POSIX
/// shm under /dev/shm, so a clean call leaves nothing matching the
/// service's name prefix behind.
pub fn shm_objects_remaining(service: &str) -> usize {
    let prefix = format!("lc-{service}-");
    match std::fs::read_dir("/dev/shm") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .count(),
        Err(_) => 0,
    }
}

/// Error type for scenario plumbing.
#[derive(Debug)]
pub enum TestError {
    /// Endpoint or service setup failed.
    Setup(String),
    /// A call failed that should have succeeded.
    Call(Error),
    /// The transport broke its contract.
    Assertion(String),
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Call(err) => write!(f, "call error: {err}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<Error> for TestError {
    fn from(err: Error) -> Self {
        TestError::Call(err)
    }
}

/// Stock handlers used by the scenarios.
pub mod handlers {
    /// Echo the request back unchanged.
    pub fn identity(request: &[u8]) -> Result<Vec<u8>, String> {
        Ok(request.to_vec())
    }

    /// Reverse the request bytes.
    pub fn reverse(request: &[u8]) -> Result<Vec<u8>, String> {
        Ok(request.iter().rev().copied().collect())
    }

    /// Ignore the request and reply with `len` bytes of `fill`.
    pub fn constant(
        len: usize,
        fill: u8,
    ) -> impl Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static {
        move |_request| Ok(vec![fill; len])
    }

    /// Fail every request with `message`.
    pub fn failing(
        message: &'static str,
    ) -> impl Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static {
        move |_request| Err(message.to_owned())
    }

    /// Sleep `delay`, then echo. For serialization measurements.
    pub fn slow_identity(
        delay: std::time::Duration,
    ) -> impl Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static {
        move |request| {
            std::thread::sleep(delay);
            Ok(request.to_vec())
        }
    }
}

/// A served endpoint plus the spin task driving it. Dropping the fixture
/// stops the loop and unlinks the service socket.
pub struct ServedService {
    pub endpoint: Arc<Endpoint>,
    pub service: String,
    spin: tokio::task::JoinHandle<()>,
}

impl ServedService {
    /// Register `handler` under a fresh unique name and start serving it
    /// on a background task.
    pub fn start<H: Handler>(label: &str, handler: H) -> Result<Self, TestError> {
        let service = unique_service_name(label);
        let endpoint =
            Arc::new(Endpoint::new().map_err(|e| TestError::Setup(format!("endpoint: {e}")))?);
        endpoint
            .create_service(&service, handler)
            .map_err(|e| TestError::Setup(format!("create_service: {e}")))?;
        let spin = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                let _ = endpoint.spin().await;
            }
        });
        Ok(Self {
            endpoint,
            service,
            spin,
        })
    }

    /// A fresh caller stub for the served service.
    pub fn caller(&self) -> Result<ServiceCaller, TestError> {
        ServiceCaller::new(&self.service).map_err(|e| TestError::Setup(format!("caller: {e}")))
    }
}

impl Drop for ServedService {
    fn drop(&mut self) {
        self.spin.abort();
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// One identity call; the reply must equal the request and the shm
/// namespace must come back clean.
pub async fn run_identity_roundtrip(payload: &[u8]) {
    if let Err(e) = run_identity_roundtrip_inner(payload).await {
        panic!("run_identity_roundtrip failed: {e}");
    }
}

async fn run_identity_roundtrip_inner(payload: &[u8]) -> Result<(), TestError> {
    let served = ServedService::start("identity", handlers::identity)?;
    let caller = served.caller()?;

    let reply = caller.call(payload).await?;
    if reply != payload {
        return Err(TestError::Assertion(format!(
            "reply differs from request ({} vs {} bytes)",
            reply.len(),
            payload.len()
        )));
    }
    assert_shm_clean(&served.service)
}

/// Reverse-bytes service: the reply is the request reversed.
pub async fn run_reverse() {
    if let Err(e) = run_reverse_inner().await {
        panic!("run_reverse failed: {e}");
    }
}

async fn run_reverse_inner() -> Result<(), TestError> {
    let served = ServedService::start("reverse", handlers::reverse)?;
    let caller = served.caller()?;

    let reply = caller.call(&[0x00, 0x01, 0x02, 0x03]).await?;
    if reply != [0x03, 0x02, 0x01, 0x00] {
        return Err(TestError::Assertion(format!("bad reverse reply: {reply:?}")));
    }
    assert_shm_clean(&served.service)
}

/// Echo `len` bytes of 0xAB through the transport; exercises the
/// shared-memory path with a payload far above the control-frame scale.
pub async fn run_large_echo(len: usize) {
    if let Err(e) = run_large_echo_inner(len).await {
        panic!("run_large_echo failed: {e}");
    }
}

async fn run_large_echo_inner(len: usize) -> Result<(), TestError> {
    let served = ServedService::start("echo", handlers::identity)?;
    let caller = served.caller()?;

    let payload = vec![0xab; len];
    let reply = caller.call(&payload).await?;
    if reply != payload {
        return Err(TestError::Assertion(format!(
            "large echo corrupted: {} bytes back, {} expected",
            reply.len(),
            len
        )));
    }
    assert_shm_clean(&served.service)
}

/// Small request, large reply: forces the server-side resize path, then
/// checks both segments are gone.
pub async fn run_grow_reply(request_len: usize, reply_len: usize) {
    if let Err(e) = run_grow_reply_inner(request_len, reply_len).await {
        panic!("run_grow_reply failed: {e}");
    }
}

async fn run_grow_reply_inner(request_len: usize, reply_len: usize) -> Result<(), TestError> {
    let served = ServedService::start("grow", handlers::constant(reply_len, 0x5a))?;
    let caller = served.caller()?;

    let reply = caller.call(&vec![1u8; request_len]).await?;
    if reply.len() != reply_len || reply.iter().any(|&b| b != 0x5a) {
        return Err(TestError::Assertion(format!(
            "grow reply wrong: {} bytes back, {} expected",
            reply.len(),
            reply_len
        )));
    }
    assert_shm_clean(&served.service)
}

/// A failing handler produces `Error::Remote` with the handler's message
/// and leaves no shm objects behind.
pub async fn run_handler_error(message: &'static str) {
    if let Err(e) = run_handler_error_inner(message).await {
        panic!("run_handler_error failed: {e}");
    }
}

async fn run_handler_error_inner(message: &'static str) -> Result<(), TestError> {
    let served = ServedService::start("failing", handlers::failing(message))?;
    let caller = served.caller()?;

    match caller.call(b"anything").await {
        Err(Error::Remote(msg)) if msg == message => {}
        Err(Error::Remote(msg)) => {
            return Err(TestError::Assertion(format!(
                "remote message '{msg}' instead of '{message}'"
            )));
        }
        Ok(_) => {
            return Err(TestError::Assertion(
                "call succeeded against a failing handler".into(),
            ));
        }
        Err(err) => return Err(TestError::Call(err)),
    }
    assert_shm_clean(&served.service)
}

/// A panicking handler behaves like a failing one: the panic payload
/// comes back as the remote message.
pub async fn run_panicking_handler(message: &'static str) {
    if let Err(e) = run_panicking_handler_inner(message).await {
        panic!("run_panicking_handler failed: {e}");
    }
}

async fn run_panicking_handler_inner(message: &'static str) -> Result<(), TestError> {
    let handler =
        move |_req: &[u8]| -> Result<Vec<u8>, String> { std::panic::panic_any(message.to_owned()) };
    let served = ServedService::start("panicking", handler)?;
    let caller = served.caller()?;

    match caller.call(b"anything").await {
        Err(Error::Remote(msg)) if msg == message => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected Remote({message:?}), got {other:?}"
            )));
        }
    }
    // The host must keep serving after a panic.
    match caller.call(b"again").await {
        Err(Error::Remote(_)) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "host did not survive the panic: {other:?}"
            )));
        }
    }
    assert_shm_clean(&served.service)
}

/// Two sequential calls on one stub are independent, each on a fresh
/// connection.
pub async fn run_sequential_calls() {
    if let Err(e) = run_sequential_calls_inner().await {
        panic!("run_sequential_calls failed: {e}");
    }
}

async fn run_sequential_calls_inner() -> Result<(), TestError> {
    let served = ServedService::start("sequential", handlers::reverse)?;
    let caller = served.caller()?;

    let first = caller.call(b"abc").await?;
    let second = caller.call(b"12345").await?;
    if first != b"cba" || second != b"54321" {
        return Err(TestError::Assertion(format!(
            "sequential replies wrong: {first:?}, {second:?}"
        )));
    }
    assert_shm_clean(&served.service)
}

/// Zero-length request and reply both work.
pub async fn run_zero_length() {
    if let Err(e) = run_zero_length_inner().await {
        panic!("run_zero_length failed: {e}");
    }
}

async fn run_zero_length_inner() -> Result<(), TestError> {
    let served = ServedService::start("empty", handlers::identity)?;
    let caller = served.caller()?;

    let reply = caller.call(b"").await?;
    if !reply.is_empty() {
        return Err(TestError::Assertion(format!(
            "zero-length call returned {} bytes",
            reply.len()
        )));
    }
    assert_shm_clean(&served.service)
}

/// Two callers in overlap against one single-threaded service: both get
/// correct replies, and the handlers serialize (total wall time is at
/// least the sum of the handler delays).
pub async fn run_concurrent_callers() {
    if let Err(e) = run_concurrent_callers_inner().await {
        panic!("run_concurrent_callers failed: {e}");
    }
}

async fn run_concurrent_callers_inner() -> Result<(), TestError> {
    let delay = Duration::from_millis(100);
    let served = ServedService::start("overlap", handlers::slow_identity(delay))?;

    let caller_a = served.caller()?;
    let caller_b = served.caller()?;

    let started = Instant::now();
    let (a, b) = tokio::join!(caller_a.call(b"from A"), caller_b.call(b"from B"));
    let elapsed = started.elapsed();

    if a? != b"from A" || b? != b"from B" {
        return Err(TestError::Assertion("overlapping replies crossed".into()));
    }
    // One handler at a time: the second call cannot start before the
    // first finishes.
    if elapsed < delay * 2 - Duration::from_millis(10) {
        return Err(TestError::Assertion(format!(
            "calls overlapped inside the handler: {elapsed:?} for two {delay:?} handlers"
        )));
    }
    assert_shm_clean(&served.service)
}

/// A caller with a call timeout against a server that never answers
/// (registered but not spinning) observes a transport error.
pub async fn run_call_timeout() {
    if let Err(e) = run_call_timeout_inner().await {
        panic!("run_call_timeout failed: {e}");
    }
}

async fn run_call_timeout_inner() -> Result<(), TestError> {
    let service = unique_service_name("timeout");
    let endpoint = Arc::new(Endpoint::new().map_err(|e| TestError::Setup(e.to_string()))?);
    endpoint
        .create_service(&service, handlers::identity)
        .map_err(|e| TestError::Setup(e.to_string()))?;
    // No spin task: the listener accepts nothing, so READY never comes.

    let caller = ServiceCaller::with_config(
        &service,
        CallerConfig {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Some(Duration::from_millis(100)),
        },
    )
    .map_err(TestError::Call)?;

    match caller.call(b"stuck").await {
        Err(Error::Transport(err)) if err.kind() == std::io::ErrorKind::TimedOut => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected timeout, got {other:?}"
            )));
        }
    }
    endpoint
        .remove_service(&service)
        .map_err(|e| TestError::Setup(e.to_string()))?;
    assert_shm_clean(&service)
}

fn assert_shm_clean(service: &str) -> Result<(), TestError> {
    let remaining = shm_objects_remaining(service);
    if remaining != 0 {
        return Err(TestError::Assertion(format!(
            "{remaining} shm object(s) left behind for '{service}'"
        )));
    }
    Ok(())
}
