//! POSIX shared-memory region management

use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{madvise, mmap, munmap, shm_open, shm_unlink, MapFlags, MmapAdvise, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use tracing::{debug, warn};

use crate::{ArenaError, Result};

/// Smallest region the create path will accept
pub const MIN_REGION_SIZE: usize = 4096;

/// Largest region the create path will accept (1 GiB)
pub const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// A mapped POSIX shared-memory object.
///
/// The creator owns the kernel name and unlinks it on close; openers only
/// unmap. The mapping base stays valid for the lifetime of the handle.
pub struct SharedRegion {
    /// Kernel object name, e.g. `/qads_t1`
    name: String,
    size: usize,
    ptr: NonNull<u8>,
    fd: RawFd,
    is_creator: bool,
    mapped: bool,
}

impl SharedRegion {
    /// Create a new shared-memory object exclusively and map it.
    ///
    /// Fails with [`ArenaError::AlreadyExists`] if the kernel name is taken
    /// (a stale region from a crashed owner must be removed out of band).
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size < MIN_REGION_SIZE || size > MAX_REGION_SIZE {
            return Err(ArenaError::InvalidSize {
                size,
                min: MIN_REGION_SIZE,
                max: MAX_REGION_SIZE,
            });
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ArenaError::from_errno(e as i32, name))?;

        if let Err(e) = nix::unistd::ftruncate(fd, size as i64) {
            let _ = close(fd);
            let _ = shm_unlink(name);
            return Err(ArenaError::from_errno(e as i32, name));
        }

        let ptr = match Self::map(fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = close(fd);
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        debug!(name, size, "created shared memory region");

        Ok(Self {
            name: name.to_string(),
            size,
            ptr,
            fd,
            is_creator: true,
            mapped: true,
        })
    }

    /// Open an existing shared-memory object and map it at its
    /// kernel-reported size.
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ArenaError::from_errno(e as i32, name))?;

        let stat = nix::sys::stat::fstat(fd)
            .map_err(|e| ArenaError::from_errno(e as i32, name))?;
        let size = stat.st_size as usize;

        let ptr = match Self::map(fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = close(fd);
                return Err(e);
            }
        };

        debug!(name, size, "opened shared memory region");

        Ok(Self {
            name: name.to_string(),
            size,
            ptr,
            fd,
            is_creator: false,
            mapped: true,
        })
    }

    fn map(fd: RawFd, size: usize) -> Result<NonNull<u8>> {
        let length = NonZeroUsize::new(size).ok_or(ArenaError::InvalidSize {
            size,
            min: MIN_REGION_SIZE,
            max: MAX_REGION_SIZE,
        })?;

        let raw = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| ArenaError::from_errno(e as i32, "mmap"))?;

        // Advisory; a refusal costs a little warm-up, nothing else.
        if let Err(e) = unsafe { madvise(raw, size, MmapAdvise::MADV_WILLNEED) } {
            debug!(error = %e, "madvise(WILLNEED) refused");
        }

        NonNull::new(raw as *mut u8).ok_or_else(|| {
            ArenaError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether this handle created (and therefore owns) the kernel name.
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Unmap and, for the creator, unlink the kernel name.
    ///
    /// Errors are logged and swallowed; close must always make forward
    /// progress during teardown.
    pub fn close(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;

        if let Err(e) = unsafe { munmap(self.ptr.as_ptr() as *mut _, self.size) } {
            warn!(name = %self.name, error = %e, "munmap failed");
        }
        if self.is_creator {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, error = %e, "shm_unlink failed");
            }
        }
        if let Err(e) = close(self.fd) {
            warn!(name = %self.name, error = %e, "close failed");
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.close();
    }
}

// Safety: the mapping base is stable and the kernel object outlives the
// handle; interior mutation goes through atomics or producer-exclusive slots.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "/qads_region_{tag}_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_open_close() {
        let name = unique("basic");
        let region = SharedRegion::create(&name, 1024 * 1024).unwrap();
        assert_eq!(region.len(), 1024 * 1024);
        assert!(region.is_creator());

        let opened = SharedRegion::open(&name).unwrap();
        assert_eq!(opened.len(), 1024 * 1024);
        assert!(!opened.is_creator());

        drop(region);
        // Creator unlinked the name; a fresh open must fail.
        assert!(matches!(
            SharedRegion::open(&name),
            Err(ArenaError::NotFound(_))
        ));
    }

    #[test]
    fn test_exclusive_create() {
        let name = unique("excl");
        let _region = SharedRegion::create(&name, 1024 * 1024).unwrap();
        assert!(matches!(
            SharedRegion::create(&name, 1024 * 1024),
            Err(ArenaError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_size_bounds() {
        let name = unique("bounds");
        assert!(matches!(
            SharedRegion::create(&name, 16),
            Err(ArenaError::InvalidSize { .. })
        ));
        assert!(matches!(
            SharedRegion::create(&name, MAX_REGION_SIZE + 1),
            Err(ArenaError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_shared_bytes_visible_across_handles() {
        let name = unique("bytes");
        let writer = SharedRegion::create(&name, 1024 * 1024).unwrap();
        let reader = SharedRegion::open(&name).unwrap();

        unsafe {
            std::ptr::write_bytes(writer.as_ptr().add(4096), 0xAB, 16);
            let view = std::slice::from_raw_parts(reader.as_ptr().add(4096), 16);
            assert!(view.iter().all(|&b| b == 0xAB));
        }
    }
}
