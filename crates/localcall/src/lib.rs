//! localcall: same-host RPC over shared memory.
//!
//! A client sends opaque bytes to a named service; the server runs a
//! handler over them and returns opaque bytes. Control messages travel
//! over a Unix domain socket while the payloads themselves move through
//! POSIX shared memory, so a 100 MiB tensor costs two memcpys instead of
//! a socket copy.
//!
//! # Quick Start
//!
//! Server process:
//!
//! ```ignore
//! use localcall::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> localcall::Result<()> {
//!     let endpoint = Endpoint::new()?;
//!     endpoint.create_service("thumbnail", |req: &[u8]| -> Result<Vec<u8>, String> {
//!         Ok(shrink(req))
//!     })?;
//!     endpoint.spin().await
//! }
//! ```
//!
//! Client process:
//!
//! ```ignore
//! use localcall::ServiceCaller;
//!
//! let caller = ServiceCaller::new("thumbnail")?;
//! let thumb = caller.call(&image_bytes).await?;
//! ```
//!
//! # Rendezvous
//!
//! Each call runs a three-step handshake on its own connection:
//!
//! ```text
//! caller                                server
//!   │  create shm, copy request in        │
//!   ├── REQUEST { shm_name, capacity } ──►│  map shm, copy request out
//!   │◄───────────── READY ────────────────┤  run handler
//!   │                                     │  copy reply in (reuse or grow)
//!   │◄── DONE { shm_name, capacity } ─────┤
//!   │  copy reply out, unlink shm         │
//! ```
//!
//! The REQUEST/READY/DONE frames double as the happens-before fences for
//! the shared segment, so the segment itself carries no locks. A failed
//! handler replaces DONE with `ERROR { message }`, which surfaces to the
//! caller as [`Error::Remote`].
//!
//! # Scope
//!
//! Same host, same user, one request and one reply per connection. There
//! is no pub/sub, no cross-service ordering, no persistence, and no
//! security beyond the 0600 socket and shm modes.

pub mod caller;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod host;
pub mod registry;
pub mod segment;

pub use caller::{CallerConfig, ServiceCaller, MIN_SEGMENT_CAPACITY};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use frame::Frame;
pub use host::{Handler, ServiceHost};
pub use segment::Segment;
