//! Error types for the shared-memory arena

use thiserror::Error;

/// Arena error types
#[derive(Error, Debug)]
pub enum ArenaError {
    /// Region name collides on producer attach
    #[error("shared memory region already exists: {0}")]
    AlreadyExists(String),

    /// Region name missing on consumer attach
    #[error("shared memory region not found: {0}")]
    NotFound(String),

    /// Header magic does not identify a qads region
    #[error("invalid region header: {0}")]
    InvalidHeader(String),

    /// Region was written by an incompatible protocol version
    #[error("unsupported protocol version {found}")]
    VersionMismatch { found: u32 },

    /// Header geometry fails structural validation
    #[error("corrupt region header: {0}")]
    CorruptHeader(String),

    /// Operation called on a handle with the opposite role
    #[error("{op} called on a {role} handle")]
    WrongRole {
        op: &'static str,
        role: &'static str,
    },

    /// Serialized batch does not fit a ring slot
    #[error("payload of {size} bytes exceeds slot capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    /// Timed wait expired
    #[error("operation timed out")]
    Timeout,

    /// Requested region size outside the supported bounds
    #[error("invalid region size {size}: must be between {min} and {max}")]
    InvalidSize {
        size: usize,
        min: usize,
        max: usize,
    },

    /// Stream name cannot be turned into a kernel object name
    #[error("invalid stream name: {0}")]
    InvalidName(String),

    /// Ring depth outside the supported bounds
    #[error("invalid buffer count {0}: must be at least 1")]
    InvalidBufferCount(usize),

    /// Slot state contradicts the token accounting
    #[error("inconsistent ring state: {0}")]
    InconsistentState(String),

    /// Columnar serialization failure
    #[error("codec error: {0}")]
    Codec(#[from] arrow::error::ArrowError),

    /// OS-level failure (shm, mmap, semaphore)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ArenaError>;

impl ArenaError {
    /// Check if the error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            ArenaError::Timeout => true,
            ArenaError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Map an OS errno from a named-object call onto the arena error kinds
    pub(crate) fn from_errno(errno: i32, name: &str) -> Self {
        match errno {
            libc::EEXIST => ArenaError::AlreadyExists(name.to_string()),
            libc::ENOENT => ArenaError::NotFound(name.to_string()),
            libc::ETIMEDOUT => ArenaError::Timeout,
            _ => ArenaError::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}
