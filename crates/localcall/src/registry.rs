//! Service registry: name validation and filesystem mapping.
//!
//! There is no directory service. A service name maps by pure string
//! composition to a socket path inside the runtime directory and to a
//! family of shared-memory object names; the filesystem is the registry.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Longest accepted service name, in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 96;

/// Prefix shared by socket files and shm object names.
const NAME_PREFIX: &str = "lc-";

/// Process-wide counter feeding [`next_shm_name`]. Monotonic, so a name
/// collision can always be retried with a fresh value.
static SHM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Check that `name` is a usable service name: non-empty printable ASCII,
/// at most [`MAX_SERVICE_NAME_LEN`] bytes, no path separators.
///
/// Runs before any socket or segment is created, so a bad name never
/// touches the filesystem.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Protocol("service name is empty".into()));
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(Error::Protocol(format!(
            "service name '{name}' exceeds {MAX_SERVICE_NAME_LEN} bytes"
        )));
    }
    if !name.bytes().all(|b| (b' '..=b'~').contains(&b)) {
        return Err(Error::Protocol(format!(
            "service name '{}' contains non-printable or non-ASCII bytes",
            name.escape_default()
        )));
    }
    if name.contains('/') {
        return Err(Error::Protocol(format!(
            "service name '{name}' contains a path separator"
        )));
    }
    Ok(())
}

/// Directory holding the service sockets: `$XDG_RUNTIME_DIR` if set, else
/// `/tmp`.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Socket path for a service: `<runtime-dir>/lc-<name>.sock`.
pub fn socket_path(name: &str) -> PathBuf {
    runtime_dir().join(format!("{NAME_PREFIX}{name}.sock"))
}

/// Next shared-memory object name for a service:
/// `/lc-<name>-<pid>-<seq>`. The leading slash is required by shm_open.
pub fn next_shm_name(name: &str) -> String {
    let seq = SHM_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("/{NAME_PREFIX}{name}-{}-{seq}", process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        validate_service_name("camera.frames").unwrap();
        validate_service_name("a").unwrap();
        validate_service_name(&"x".repeat(MAX_SERVICE_NAME_LEN)).unwrap();
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_service_name("").is_err());
    }

    #[test]
    fn rejects_overlong_name() {
        assert!(validate_service_name(&"x".repeat(MAX_SERVICE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn rejects_path_separator() {
        assert!(validate_service_name("a/b").is_err());
        assert!(validate_service_name("/abs").is_err());
    }

    #[test]
    fn rejects_non_ascii() {
        assert!(validate_service_name("caf\u{e9}").is_err());
        assert!(validate_service_name("tab\there").is_err());
    }

    #[test]
    fn socket_path_shape() {
        let path = socket_path("example");
        let file = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(file, "lc-example.sock");
    }

    #[test]
    fn shm_names_are_unique_and_absolute() {
        let a = next_shm_name("svc");
        let b = next_shm_name("svc");
        assert_ne!(a, b);
        assert!(a.starts_with("/lc-svc-"));
        assert!(b.starts_with("/lc-svc-"));
    }
}
