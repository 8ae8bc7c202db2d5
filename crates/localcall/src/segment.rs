//! Named shared-memory segments.
//!
//! A segment is a POSIX shm object carrying one payload at a time:
//!
//! ```text
//! ┌────────────────────────┬──────────────────────────────────────────┐
//! │ payload length (u64 LE)│ payload bytes                            │
//! │ offset 0..8            │ offset 8..8+len                          │
//! └────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The stored length (rather than the object size) lets one segment carry
//! a request and then a differently sized reply, and lets segments be
//! provisioned with slack.
//!
//! Ownership convention: whichever side creates a segment unlinks its name,
//! but only once the peer has opened it; both sides unmap on drop. The
//! READY/DONE control frames order all accesses, so the mapping itself
//! needs no locking.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::registry;

/// Bytes reserved at offset 0 for the payload-length prefix.
pub const HEADER_LEN: usize = 8;

/// How many fresh names to try before giving up on segment creation.
const CREATE_ATTEMPTS: usize = 16;

/// Segment-level failures, converted to [`crate::Error`] at the call
/// boundary.
#[derive(Debug)]
pub enum SegmentError {
    /// `create` found the name already taken.
    AlreadyExists,
    /// `open` found no object under the name.
    NotFound,
    /// The OS refused to provision backing memory.
    NoSpace,
    /// Payload does not fit the mapped capacity.
    TooLarge { len: usize, capacity: usize },
    /// The stored length prefix exceeds what the segment can hold.
    Corrupt { claimed: u64, capacity: usize },
    /// Any other OS failure.
    Os(io::Error),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::AlreadyExists => write!(f, "shm name already taken"),
            SegmentError::NotFound => write!(f, "shm object does not exist"),
            SegmentError::NoSpace => write!(f, "no space for shm object"),
            SegmentError::TooLarge { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds segment of {capacity} bytes")
            }
            SegmentError::Corrupt { claimed, capacity } => {
                write!(f, "header claims {claimed} bytes in a segment of {capacity} bytes")
            }
            SegmentError::Os(err) => write!(f, "shm syscall failed: {err}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SegmentError::Os(err) => Some(err),
            _ => None,
        }
    }
}

/// A mapped shared-memory segment.
///
/// Dropping the handle unmaps; the name stays in the OS namespace until
/// [`Segment::unlink`] (or [`unlink_by_name`]) removes it.
pub struct Segment {
    name: String,
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the handle exclusively owns its mapping and only hands out
// copies of the mapped bytes, never references into them.
unsafe impl Send for Segment {}
// SAFETY: shared access only reads through raw pointers behind &self;
// writers take &mut self.
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new shm object of exactly `capacity` bytes (at least
    /// [`HEADER_LEN`]) and map it read/write. Mode 0600: same-user
    /// processes only.
    pub fn create(name: &str, capacity: usize) -> Result<Self, SegmentError> {
        if capacity < HEADER_LEN {
            return Err(SegmentError::Os(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment capacity {capacity} is smaller than the {HEADER_LEN}-byte header"),
            )));
        }
        let c_name = cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => SegmentError::AlreadyExists,
                Some(libc::ENOSPC) | Some(libc::ENOMEM) | Some(libc::EMFILE) => {
                    SegmentError::NoSpace
                }
                _ => SegmentError::Os(err),
            });
        }
        // SAFETY: shm_open succeeded; we own the descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: fd is a valid shm descriptor.
        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), capacity as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unlink_by_name(name);
            return Err(match err.raw_os_error() {
                Some(libc::ENOSPC) | Some(libc::ENOMEM) => SegmentError::NoSpace,
                _ => SegmentError::Os(err),
            });
        }

        let ptr = match map(&fd, capacity) {
            Ok(ptr) => ptr,
            Err(err) => {
                // Nobody else can have opened a name we just created.
                unlink_by_name(name);
                return Err(err);
            }
        };
        // The descriptor is no longer needed once the mapping exists.
        drop(fd);

        Ok(Self {
            name: name.to_owned(),
            ptr,
            capacity,
        })
    }

    /// Map an existing shm object read/write. The capacity is taken from
    /// the object itself.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        let c_name = cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => SegmentError::NotFound,
                _ => SegmentError::Os(err),
            });
        }
        // SAFETY: shm_open succeeded; we own the descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid and stat points at enough room for a stat
        // struct.
        let ret = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
        if ret < 0 {
            return Err(SegmentError::Os(io::Error::last_os_error()));
        }
        // SAFETY: fstat succeeded, so the struct is initialized.
        let capacity = unsafe { stat.assume_init() }.st_size as usize;

        let ptr = map(&fd, capacity)?;
        drop(fd);

        Ok(Self {
            name: name.to_owned(),
            ptr,
            capacity,
        })
    }

    /// Name of the underlying shm object, leading slash included.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total mapped size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Usable payload bytes: capacity minus the length prefix.
    pub fn payload_capacity(&self) -> usize {
        self.capacity.saturating_sub(HEADER_LEN)
    }

    /// Store the length prefix and copy `payload` in at offset 8.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), SegmentError> {
        if payload.len() > self.payload_capacity() {
            return Err(SegmentError::TooLarge {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        let prefix = (payload.len() as u64).to_le_bytes();
        // SAFETY: the mapping holds at least HEADER_LEN + payload.len()
        // bytes (checked above) and this handle is the only local accessor.
        unsafe {
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), self.ptr.as_ptr(), HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.ptr.as_ptr().add(HEADER_LEN),
                payload.len(),
            );
        }
        Ok(())
    }

    /// Read the length prefix and return a copy of that many payload
    /// bytes.
    pub fn read_payload(&self) -> Result<Vec<u8>, SegmentError> {
        if self.capacity < HEADER_LEN {
            return Err(SegmentError::Corrupt {
                claimed: 0,
                capacity: self.capacity,
            });
        }
        let mut prefix = [0u8; HEADER_LEN];
        // SAFETY: the mapping holds at least HEADER_LEN bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), prefix.as_mut_ptr(), HEADER_LEN);
        }
        let claimed = u64::from_le_bytes(prefix);
        if claimed > self.payload_capacity() as u64 {
            return Err(SegmentError::Corrupt {
                claimed,
                capacity: self.capacity,
            });
        }
        let len = claimed as usize;
        let mut out = vec![0u8; len];
        // SAFETY: claimed <= capacity - HEADER_LEN, checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(HEADER_LEN), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Remove the segment's name from the OS namespace. The mapping stays
    /// usable until drop. Idempotent.
    pub fn unlink(&self) {
        unlink_by_name(&self.name);
    }

    #[cfg(test)]
    fn poke_prefix(&mut self, claimed: u64) {
        let prefix = claimed.to_le_bytes();
        // SAFETY: every segment holds at least HEADER_LEN bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), self.ptr.as_ptr(), HEADER_LEN);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity came from a successful mmap and are
        // unmapped exactly once.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.capacity) };
        if ret < 0 {
            tracing::warn!(
                name = %self.name,
                "munmap failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Create a segment under a fresh name for `service`, retrying with a new
/// counter value when a stale object of the same name is found.
pub fn create_for_service(service: &str, capacity: usize) -> Result<Segment, SegmentError> {
    for _ in 0..CREATE_ATTEMPTS {
        let name = registry::next_shm_name(service);
        match Segment::create(&name, capacity) {
            Err(SegmentError::AlreadyExists) => continue,
            other => return other,
        }
    }
    Err(SegmentError::Os(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free shm name for '{service}' after {CREATE_ATTEMPTS} attempts"),
    )))
}

/// Unlink a shm name. An absent name is not an error.
pub fn unlink_by_name(name: &str) {
    let Ok(c_name) = CString::new(name) else {
        return;
    };
    // SAFETY: c_name is a valid NUL-terminated string.
    let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            tracing::warn!(name, "shm_unlink failed: {err}");
        }
    }
}

/// Round `len` up to the next page boundary.
pub fn page_aligned(len: usize) -> usize {
    // SAFETY: sysconf reads a constant; no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}

fn cstring(name: &str) -> Result<CString, SegmentError> {
    CString::new(name).map_err(|_| {
        SegmentError::Os(io::Error::new(
            io::ErrorKind::InvalidInput,
            "shm name contains a NUL byte",
        ))
    })
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>, SegmentError> {
    // SAFETY: fd is a valid shm descriptor sized to at least `len` bytes.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOMEM) => SegmentError::NoSpace,
            _ => SegmentError::Os(err),
        });
    }
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| SegmentError::Os(io::Error::other("mmap returned NULL")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_name() -> String {
        format!(
            "/lc-segment-test-{}-{}",
            std::process::id(),
            TEST_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn roundtrip() {
        let name = test_name();
        let mut seg = Segment::create(&name, 4096).unwrap();
        seg.write_payload(b"large payloads welcome").unwrap();
        assert_eq!(seg.read_payload().unwrap(), b"large payloads welcome");
        seg.unlink();
    }

    #[test]
    fn roundtrip_through_second_mapping() {
        let name = test_name();
        let mut writer = Segment::create(&name, 4096).unwrap();
        writer.write_payload(&[0xab; 100]).unwrap();

        let reader = Segment::open(&name).unwrap();
        assert_eq!(reader.capacity(), 4096);
        assert_eq!(reader.read_payload().unwrap(), vec![0xab; 100]);

        writer.unlink();
    }

    #[test]
    fn zero_length_payload() {
        let name = test_name();
        let mut seg = Segment::create(&name, HEADER_LEN).unwrap();
        seg.write_payload(b"").unwrap();
        assert_eq!(seg.read_payload().unwrap(), Vec::<u8>::new());
        seg.unlink();
    }

    #[test]
    fn write_rejects_oversized_payload() {
        let name = test_name();
        let mut seg = Segment::create(&name, 64).unwrap();
        let payload = vec![0u8; 64 - HEADER_LEN + 1];
        assert!(matches!(
            seg.write_payload(&payload),
            Err(SegmentError::TooLarge { .. })
        ));
        seg.unlink();
    }

    #[test]
    fn read_rejects_corrupt_prefix() {
        let name = test_name();
        let mut seg = Segment::create(&name, 64).unwrap();
        seg.poke_prefix(u64::MAX);
        assert!(matches!(
            seg.read_payload(),
            Err(SegmentError::Corrupt { .. })
        ));
        seg.unlink();
    }

    #[test]
    fn create_rejects_taken_name() {
        let name = test_name();
        let seg = Segment::create(&name, 64).unwrap();
        assert!(matches!(
            Segment::create(&name, 64),
            Err(SegmentError::AlreadyExists)
        ));
        seg.unlink();
    }

    #[test]
    fn create_rejects_undersized_capacity() {
        let name = test_name();
        assert!(Segment::create(&name, HEADER_LEN - 1).is_err());
    }

    #[test]
    fn open_missing_name() {
        assert!(matches!(
            Segment::open("/lc-segment-test-never-created"),
            Err(SegmentError::NotFound)
        ));
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = test_name();
        let seg = Segment::create(&name, 64).unwrap();
        seg.unlink();
        seg.unlink();
        unlink_by_name(&name);
        assert!(matches!(Segment::open(&name), Err(SegmentError::NotFound)));
    }

    #[test]
    fn create_for_service_allocates_fresh_names() {
        let a = create_for_service("alloc", 64).unwrap();
        let b = create_for_service("alloc", 64).unwrap();
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("/lc-alloc-"));
        a.unlink();
        b.unlink();
    }

    #[test]
    fn page_aligned_rounds_up() {
        assert_eq!(page_aligned(0), 0);
        let page = page_aligned(1);
        assert!(page >= 4096);
        assert_eq!(page_aligned(page), page);
        assert_eq!(page_aligned(page + 1), page * 2);
    }
}
