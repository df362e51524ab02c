//! Shared-memory control-block layout and validation
//!
//! The first `header_size` bytes of every region hold a [`RegionHeader`]
//! followed by one [`SlotState`] per ring slot. Both sides of the transport
//! map the same physical bytes, so every field here is `#[repr(C)]`, the
//! atomics are lock-free machine words, and nothing in the block ever holds
//! a pointer.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use crate::{ArenaError, Result};

/// Protocol magic number ("QDAS")
pub const MAGIC: u32 = 0x5144_4153;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Alignment unit for the header block and slot payloads
pub const CACHE_LINE: usize = 64;

/// Capacity of the embedded semaphore-name fields, terminator included
pub const SEM_NAME_CAP: usize = 64;

/// Longest accepted user-chosen stream name: the region object name
/// (`/qads_<name>`) must fit the kernel's 255-byte object-name limit. The
/// wider semaphore names are truncated into their 63-byte header fields
/// instead of rejecting the stream name.
pub const MAX_STREAM_NAME: usize = 255 - 6;

/// Fixed control block at region offset 0.
///
/// The plain fields are written exactly once by the producer during attach
/// and never mutated afterwards; consumers treat them as read-only. The
/// atomic fields are the only cross-process mutable state besides the slot
/// table and the payload bytes themselves.
#[repr(C, align(64))]
pub struct RegionHeader {
    pub magic: u32,
    pub version: u32,
    pub total_size: u64,
    pub header_size: u64,
    pub buffer_count: u64,
    pub buffer_size: u64,
    pub buffers_offset: u64,
    /// Count of successful publishes; next produce slot is `write_sequence % N`
    pub write_sequence: AtomicU64,
    /// Count of successful consumes; next consume slot is `read_sequence % N`
    pub read_sequence: AtomicU64,
    /// True between producer attach and producer close/finish
    pub writer_active: AtomicBool,
    /// Number of currently-attached consumers
    pub reader_count: AtomicI32,
    pub free_sem_name: [u8; SEM_NAME_CAP],
    pub ready_sem_name: [u8; SEM_NAME_CAP],
}

/// Per-slot control, one cache line per entry to keep producer and consumer
/// stores from false-sharing.
#[repr(C, align(64))]
pub struct SlotState {
    /// Bytes of valid payload in the slot, 0 while empty
    pub data_size: AtomicU64,
    /// True iff a complete payload is published and not yet consumed
    pub ready: AtomicBool,
    /// Producer publish time, monotonic microseconds, advisory only
    pub timestamp: AtomicU64,
}

// The control block is shared between processes byte-for-byte; a drift in
// either size silently breaks every attached party.
const _: () = assert!(size_of::<RegionHeader>() % CACHE_LINE == 0);
const _: () = assert!(size_of::<SlotState>() == CACHE_LINE);

/// Region geometry, computed once by the producer and copied into every
/// handle at attach time so operations never re-read the shared fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub total_size: usize,
    pub header_size: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub buffers_offset: usize,
}

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

impl Geometry {
    /// Compute the layout for a region about to be created.
    ///
    /// `header_size` covers the fixed header plus the slot-state table,
    /// rounded up to the cache line; the remainder is split into
    /// `buffer_count` cache-line-aligned slots.
    pub fn for_new_region(total_size: usize, buffer_count: usize) -> Result<Self> {
        if buffer_count == 0 {
            return Err(ArenaError::InvalidBufferCount(buffer_count));
        }

        let header_size = align_up(
            size_of::<RegionHeader>() + buffer_count * size_of::<SlotState>(),
            CACHE_LINE,
        );
        let min_size = header_size + buffer_count * CACHE_LINE;
        if total_size < min_size {
            return Err(ArenaError::InvalidSize {
                size: total_size,
                min: min_size,
                max: crate::region::MAX_REGION_SIZE,
            });
        }

        let buffer_size = align_down((total_size - header_size) / buffer_count, CACHE_LINE);

        Ok(Self {
            total_size,
            header_size,
            buffer_count,
            buffer_size,
            buffers_offset: header_size,
        })
    }

    /// Byte offset of slot `index` from the region base.
    pub fn slot_offset(&self, index: usize) -> usize {
        self.buffers_offset + index * self.buffer_size
    }
}

impl RegionHeader {
    /// Initialize the control block in freshly created (zeroed) mapping
    /// bytes.
    ///
    /// Plain fields first, atomics after; `writer_active` stays false — the
    /// caller flips it with release ordering as the final step of producer
    /// attach, which is what makes everything written here visible to
    /// consumers.
    ///
    /// # Safety
    ///
    /// `base` must point at least `geometry.header_size` writable bytes that
    /// no other process is concurrently accessing.
    pub unsafe fn initialize(base: *mut u8, geometry: &Geometry, free_sem: &str, ready_sem: &str) {
        std::ptr::write_bytes(base, 0, geometry.header_size);

        let header = &mut *(base as *mut RegionHeader);
        header.magic = MAGIC;
        header.version = PROTOCOL_VERSION;
        header.total_size = geometry.total_size as u64;
        header.header_size = geometry.header_size as u64;
        header.buffer_count = geometry.buffer_count as u64;
        header.buffer_size = geometry.buffer_size as u64;
        header.buffers_offset = geometry.buffers_offset as u64;
        store_name(&mut header.free_sem_name, free_sem);
        store_name(&mut header.ready_sem_name, ready_sem);

        header.write_sequence.store(0, Ordering::Relaxed);
        header.read_sequence.store(0, Ordering::Relaxed);
        header.reader_count.store(0, Ordering::Relaxed);
        header.writer_active.store(false, Ordering::Release);
    }

    /// Validate the header on consumer attach and return a local geometry
    /// copy.
    ///
    /// The `writer_active` acquire load pairs with the producer's release
    /// store, ordering the plain-field reads below after the producer's
    /// initialization writes.
    pub fn validate(&self, os_size: usize) -> Result<Geometry> {
        let _ = self.writer_active.load(Ordering::Acquire);

        if self.magic != MAGIC {
            return Err(ArenaError::InvalidHeader(format!(
                "bad magic 0x{:08x}",
                self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ArenaError::VersionMismatch {
                found: self.version,
            });
        }

        let total_size = self.total_size as usize;
        let header_size = self.header_size as usize;
        let buffer_count = self.buffer_count as usize;
        let buffer_size = self.buffer_size as usize;
        let buffers_offset = self.buffers_offset as usize;

        if total_size != os_size {
            return Err(ArenaError::CorruptHeader(format!(
                "declared size {total_size} does not match mapped size {os_size}"
            )));
        }
        if buffer_count == 0 {
            return Err(ArenaError::CorruptHeader("zero ring slots".to_string()));
        }
        if buffer_size == 0 || buffer_size % CACHE_LINE != 0 {
            return Err(ArenaError::CorruptHeader(format!(
                "unaligned slot size {buffer_size}"
            )));
        }
        let min_header = size_of::<RegionHeader>() + buffer_count * size_of::<SlotState>();
        if header_size < min_header || buffers_offset < header_size {
            return Err(ArenaError::CorruptHeader(format!(
                "header block {header_size} too small for {buffer_count} slots"
            )));
        }
        let ring_end = buffers_offset
            .checked_add(buffer_count.saturating_mul(buffer_size))
            .ok_or_else(|| ArenaError::CorruptHeader("ring extent overflows".to_string()))?;
        if ring_end > total_size {
            return Err(ArenaError::CorruptHeader(format!(
                "ring extent {ring_end} exceeds region size {total_size}"
            )));
        }

        Ok(Geometry {
            total_size,
            header_size,
            buffer_count,
            buffer_size,
            buffers_offset,
        })
    }

    /// Extract a NUL-terminated semaphore name from one of the embedded
    /// fields.
    pub fn sem_name(field: &[u8; SEM_NAME_CAP]) -> Result<String> {
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ArenaError::CorruptHeader("unterminated semaphore name".to_string()))?;
        if end == 0 {
            return Err(ArenaError::CorruptHeader(
                "empty semaphore name".to_string(),
            ));
        }
        std::str::from_utf8(&field[..end])
            .map(str::to_owned)
            .map_err(|_| ArenaError::CorruptHeader("non-UTF-8 semaphore name".to_string()))
    }
}

impl std::fmt::Debug for RegionHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionHeader")
            .field("magic", &self.magic)
            .field("version", &self.version)
            .field("total_size", &self.total_size)
            .field("buffer_count", &self.buffer_count)
            .field("buffer_size", &self.buffer_size)
            .field("write_sequence", &self.write_sequence.load(Ordering::Acquire))
            .field("read_sequence", &self.read_sequence.load(Ordering::Acquire))
            .field("writer_active", &self.writer_active.load(Ordering::Acquire))
            .field("reader_count", &self.reader_count.load(Ordering::Acquire))
            .finish()
    }
}

fn store_name(field: &mut [u8; SEM_NAME_CAP], name: &str) {
    let take = name.len().min(SEM_NAME_CAP - 1);
    field[..take].copy_from_slice(&name.as_bytes()[..take]);
    field[take] = 0;
}

/// Kernel object name for the region backing stream `name`.
pub fn region_object_name(name: &str) -> String {
    format!("/qads_{name}")
}

/// Kernel name of the free-slots semaphore for stream `name`, truncated to
/// fit the header's embedded name field.
pub fn free_sem_name(name: &str) -> String {
    truncate_sem_name(format!("/qads_f_{name}"))
}

/// Kernel name of the ready-slots semaphore for stream `name`, truncated to
/// fit the header's embedded name field.
pub fn ready_sem_name(name: &str) -> String {
    truncate_sem_name(format!("/qads_r_{name}"))
}

/// Both sides must agree on the semaphore names byte-for-byte, so the
/// truncation happens here, at derivation, and the header simply stores the
/// result.
fn truncate_sem_name(mut name: String) -> String {
    if name.len() > SEM_NAME_CAP - 1 {
        let mut end = SEM_NAME_CAP - 1;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Validate a user-chosen stream name before deriving kernel names from it.
pub fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ArenaError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_STREAM_NAME {
        return Err(ArenaError::InvalidName(format!(
            "name longer than {MAX_STREAM_NAME} bytes"
        )));
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(ArenaError::InvalidName(
            "name contains '/' or NUL".to_string(),
        ));
    }
    Ok(())
}
