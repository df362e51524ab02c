//! Kernel-named counting semaphores
//!
//! The ring is paced by two POSIX named semaphores: `free` tokens count
//! empty slots, `ready` tokens count published slots. They are the only
//! blocking primitives in the transport; everything else is atomics in the
//! mapped region. nix does not wrap `sem_open` and friends, so this layer
//! talks to libc directly.

use std::ffi::CString;
use std::time::Duration;

use tracing::warn;

use crate::{ArenaError, Result};

/// A handle to a kernel-named counting semaphore.
///
/// The creator owns the kernel name and unlinks it on close; openers only
/// close their handle. Posts and waits are safe from any thread.
pub struct NamedSemaphore {
    name: CString,
    raw: *mut libc::sem_t,
    is_creator: bool,
    closed: bool,
}

// Safety: sem_t handles returned by sem_open may be used concurrently from
// multiple threads; the kernel serializes post/wait.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore exclusively at `name` with the given initial
    /// token count.
    ///
    /// Any stale kernel name left behind by a crashed prior owner is
    /// unlinked first, so creation only fails `AlreadyExists` when a live
    /// owner holds the name between our unlink and create.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        unsafe {
            libc::sem_unlink(c_name.as_ptr());
        }

        let raw = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            return Err(Self::last_error(name));
        }

        Ok(Self {
            name: c_name,
            raw,
            is_creator: true,
            closed: false,
        })
    }

    /// Open an existing semaphore by kernel name.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        let raw = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if raw == libc::SEM_FAILED {
            return Err(Self::last_error(name));
        }

        Ok(Self {
            name: c_name,
            raw,
            is_creator: false,
            closed: false,
        })
    }

    /// Block until a token is available.
    pub fn wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.raw) };
            if rc == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                e => return Err(ArenaError::from_errno(e, self.name_lossy())),
            }
        }
    }

    /// Take a token without blocking; `Timeout` if none is available.
    pub fn try_wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_trywait(self.raw) };
            if rc == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(ArenaError::Timeout),
                e => return Err(ArenaError::from_errno(e, self.name_lossy())),
            }
        }
    }

    /// Block until a token is available or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = absolute_deadline(timeout)?;
        loop {
            let rc = unsafe { timed_wait(self.raw, &deadline) };
            if rc == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::ETIMEDOUT => return Err(ArenaError::Timeout),
                e => return Err(ArenaError::from_errno(e, self.name_lossy())),
            }
        }
    }

    /// Dispatch on the three wait flavors: infinite, poll, timed.
    pub fn wait_opt(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self.wait(),
            Some(t) if t.is_zero() => self.try_wait(),
            Some(t) => self.wait_timeout(t),
        }
    }

    /// Release one token.
    pub fn post(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.raw) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ArenaError::from_errno(errno(), self.name_lossy()))
        }
    }

    /// Close the handle; the creator also unlinks the kernel name.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if unsafe { libc::sem_close(self.raw) } != 0 {
            warn!(name = self.name_lossy(), "sem_close failed");
        }
        if self.is_creator {
            if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
                warn!(name = self.name_lossy(), "sem_unlink failed");
            }
        }
    }

    /// Remove a kernel name without opening it; missing names are fine.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::c_name(name)?;
        let rc = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if rc != 0 && errno() != libc::ENOENT {
            return Err(ArenaError::from_errno(errno(), name));
        }
        Ok(())
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| ArenaError::InvalidName("name contains NUL".to_string()))
    }

    fn name_lossy(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    fn last_error(name: &str) -> ArenaError {
        ArenaError::from_errno(errno(), name)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.close();
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// Timed waits take an absolute deadline. glibc exposes sem_clockwait, which
// lets the deadline live on the monotonic clock and shrugs off wall-clock
// jumps; elsewhere the POSIX sem_timedwait contract pins us to CLOCK_REALTIME.

#[cfg(all(target_os = "linux", target_env = "gnu"))]
const DEADLINE_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const DEADLINE_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

fn absolute_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(DEADLINE_CLOCK, &mut now) } != 0 {
        return Err(ArenaError::from_errno(errno(), "clock_gettime"));
    }

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

// The `libc` crate does not bind `sem_clockwait`; declare it ourselves
// against the glibc symbol it would otherwise expose.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    fn sem_clockwait(
        sem: *mut libc::sem_t,
        clockid: libc::clockid_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe fn timed_wait(sem: *mut libc::sem_t, deadline: &libc::timespec) -> libc::c_int {
    sem_clockwait(sem, DEADLINE_CLOCK, deadline)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
unsafe fn timed_wait(sem: *mut libc::sem_t, deadline: &libc::timespec) -> libc::c_int {
    libc::sem_timedwait(sem, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "/qads_sem_{tag}_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_open_post_wait() {
        let name = unique("basic");
        let sem = NamedSemaphore::create(&name, 2).unwrap();
        sem.try_wait().unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(ArenaError::Timeout)));

        let peer = NamedSemaphore::open(&name).unwrap();
        peer.post().unwrap();
        sem.wait().unwrap();
    }

    #[test]
    fn test_timed_wait_expires() {
        let name = unique("timed");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        let started = Instant::now();
        let err = sem.wait_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ArenaError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_timed_wait_sees_post() {
        let name = unique("cross");
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        let peer = NamedSemaphore::open(&name).unwrap();

        let waiter = std::thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        peer.post().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_stale_name_is_replaced_on_create() {
        let name = unique("stale");
        // Simulate a crashed owner: create and leak the kernel name.
        let mut stale = NamedSemaphore::create(&name, 0).unwrap();
        stale.is_creator = false; // drop closes but no longer unlinks
        drop(stale);

        // A fresh create with a different initial value must win.
        let sem = NamedSemaphore::create(&name, 1).unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(ArenaError::Timeout)));
    }

    #[test]
    fn test_unlink_tolerates_missing_names() {
        let name = unique("unlink");
        NamedSemaphore::unlink(&name).unwrap();

        let mut leaked = NamedSemaphore::create(&name, 0).unwrap();
        leaked.is_creator = false;
        drop(leaked);

        NamedSemaphore::unlink(&name).unwrap();
        assert!(matches!(
            NamedSemaphore::open(&name),
            Err(ArenaError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        assert!(matches!(
            NamedSemaphore::open(&unique("missing")),
            Err(ArenaError::NotFound(_))
        ));
    }
}
