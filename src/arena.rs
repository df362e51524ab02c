//! Arena: the public handle over region, header, semaphores, and codec
//!
//! An arena handle acquires its role at attach time and keeps it for life.
//! The producer owns the region and both semaphores; consumers borrow them
//! by kernel name. Produce and consume pace each other through the `free`
//! and `ready` token counts — at most `buffer_count` batches are in flight,
//! and a full ring blocks the producer rather than dropping data.

use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::protocol::{self, Geometry, RegionHeader, SlotState};
use crate::region::SharedRegion;
use crate::stats::{Stats, StatsTracker};
use crate::sync::NamedSemaphore;
use crate::{ArenaError, Result};

/// Handle role, fixed at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

/// Arena configuration with builder-style setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// User-chosen stream name; kernel objects are derived from it
    pub name: String,
    /// Region size in bytes (header plus ring)
    pub total_size: usize,
    /// Ring depth
    pub buffer_count: usize,
    /// Default timeout for pull-style reads; `None` blocks forever
    pub default_timeout: Option<Duration>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            total_size: crate::DEFAULT_TOTAL_SIZE,
            buffer_count: crate::DEFAULT_BUFFER_COUNT,
            default_timeout: None,
        }
    }
}

impl ArenaConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_total_size(mut self, total_size: usize) -> Self {
        self.total_size = total_size;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Create the region and attach as its single producer.
    pub fn attach_producer(&self) -> Result<Arena> {
        let mut arena = Arena::attach_producer(&self.name, self.total_size, self.buffer_count)?;
        arena.default_timeout = self.default_timeout;
        Ok(arena)
    }

    /// Attach to an existing region as a consumer.
    pub fn attach_consumer(&self) -> Result<Arena> {
        let mut arena = Arena::attach_consumer(&self.name)?;
        arena.default_timeout = self.default_timeout;
        Ok(arena)
    }
}

/// A mapped arena handle: producer or consumer end of one shared ring.
pub struct Arena {
    name: String,
    role: Role,
    region: SharedRegion,
    geometry: Geometry,
    free_sem: NamedSemaphore,
    ready_sem: NamedSemaphore,
    stats: StatsTracker,
    pub(crate) default_timeout: Option<Duration>,
    closed: bool,
}

impl Arena {
    /// Create the shared region, initialize its header, create both
    /// semaphores, and mark the writer active.
    ///
    /// Fails [`ArenaError::AlreadyExists`] when the region name is in use —
    /// the exclusive create is what enforces the single-producer rule.
    pub fn attach_producer(name: &str, total_size: usize, buffer_count: usize) -> Result<Self> {
        protocol::validate_stream_name(name)?;
        let geometry = Geometry::for_new_region(total_size, buffer_count)?;

        let object_name = protocol::region_object_name(name);
        let free_name = protocol::free_sem_name(name);
        let ready_name = protocol::ready_sem_name(name);

        let region = SharedRegion::create(&object_name, total_size)?;
        // Safety: freshly created region, no other process can have attached
        // before the header below is complete.
        unsafe {
            RegionHeader::initialize(region.as_ptr(), &geometry, &free_name, &ready_name);
        }

        // Stale semaphore names from a crashed prior owner are cleared by
        // the exclusive create path itself; region/semaphore drops roll the
        // kernel state back if either create fails.
        let free_sem = NamedSemaphore::create(&free_name, buffer_count as u32)?;
        let ready_sem = NamedSemaphore::create(&ready_name, 0)?;

        let arena = Self {
            name: name.to_string(),
            role: Role::Producer,
            region,
            geometry,
            free_sem,
            ready_sem,
            stats: StatsTracker::default(),
            default_timeout: None,
            closed: false,
        };
        arena.header().writer_active.store(true, Ordering::Release);

        debug!(
            name,
            total_size,
            buffer_count,
            buffer_size = geometry.buffer_size,
            "attached producer"
        );
        Ok(arena)
    }

    /// Open an existing region, validate its header, and attach as one of
    /// any number of consumers.
    pub fn attach_consumer(name: &str) -> Result<Self> {
        protocol::validate_stream_name(name)?;
        let object_name = protocol::region_object_name(name);

        let region = SharedRegion::open(&object_name)?;
        if region.len() < size_of::<RegionHeader>() {
            return Err(ArenaError::CorruptHeader(format!(
                "region is {} bytes, smaller than the control block",
                region.len()
            )));
        }

        // Safety: size checked above; the header is read-only from here on
        // except for its atomic fields.
        let header = unsafe { &*(region.as_ptr() as *const RegionHeader) };
        let geometry = header.validate(region.len())?;

        let free_name = RegionHeader::sem_name(&header.free_sem_name)?;
        let ready_name = RegionHeader::sem_name(&header.ready_sem_name)?;
        let free_sem = NamedSemaphore::open(&free_name)?;
        let ready_sem = NamedSemaphore::open(&ready_name)?;

        header.reader_count.fetch_add(1, Ordering::AcqRel);

        debug!(name, buffer_count = geometry.buffer_count, "attached consumer");
        Ok(Self {
            name: name.to_string(),
            role: Role::Consumer,
            region,
            geometry,
            free_sem,
            ready_sem,
            stats: StatsTracker::default(),
            default_timeout: None,
            closed: false,
        })
    }

    /// Serialize `batch` into the next ring slot and publish it.
    ///
    /// Blocks while the ring is full — that is the transport's only
    /// backpressure. A batch whose frame exceeds the slot capacity fails
    /// [`ArenaError::PayloadTooLarge`] without advancing the ring.
    pub fn produce(&self, batch: &RecordBatch) -> Result<()> {
        self.ensure_role(Role::Producer, "produce")?;
        self.ensure_active()?;
        self.free_sem.wait()?;

        let index = self.write_index();
        // Safety: the free token grants exclusive write access to this slot
        // until it is published.
        let span = unsafe { self.slot_span_mut(index) };
        let frame_len = match codec::encode_batch(batch, span) {
            Ok(n) => n,
            Err(e) => {
                // Not published: hand the free token back so the window
                // accounting survives the failure.
                if let Err(rollback) = self.free_sem.post() {
                    warn!(name = %self.name, error = %rollback, "free-token rollback failed");
                }
                self.stats.record_error(&e);
                return Err(e);
            }
        };

        self.publish(index, frame_len)?;
        self.stats.record_write(frame_len);
        debug!(name = %self.name, slot = index, bytes = frame_len, "published batch");
        Ok(())
    }

    /// Publish an already-serialized payload without re-encoding.
    ///
    /// The bytes are copied verbatim into the slot; consumers see them as
    /// `data_size` bytes starting at slot byte 0, exactly like a codec
    /// frame.
    pub fn produce_bytes(&self, payload: &[u8]) -> Result<()> {
        self.ensure_role(Role::Producer, "produce_bytes")?;
        self.ensure_active()?;
        if payload.is_empty() {
            return Err(ArenaError::InvalidSize {
                size: 0,
                min: 1,
                max: self.geometry.buffer_size,
            });
        }
        if payload.len() > self.geometry.buffer_size {
            return Err(ArenaError::PayloadTooLarge {
                size: payload.len(),
                capacity: self.geometry.buffer_size,
            });
        }

        self.free_sem.wait()?;
        let index = self.write_index();
        // Safety: free token held, see produce().
        let span = unsafe { self.slot_span_mut(index) };
        span[..payload.len()].copy_from_slice(payload);

        self.publish(index, payload.len())?;
        self.stats.record_write(payload.len());
        Ok(())
    }

    /// Wait for the next published slot and decode it.
    ///
    /// `None` blocks forever, `Some(Duration::ZERO)` polls, anything else
    /// is a timed wait failing [`ArenaError::Timeout`].
    pub fn consume(&self, timeout: Option<Duration>) -> Result<RecordBatch> {
        let (index, len) = self.begin_consume("consume", timeout)?;
        let frame = unsafe { self.slot_span(index, len) };
        match codec::decode_batch(frame) {
            Ok(batch) => {
                self.finish_consume(index, len)?;
                Ok(batch)
            }
            Err(e) => {
                // Slot stays published; return the ready token we took.
                if let Err(rollback) = self.ready_sem.post() {
                    warn!(name = %self.name, error = %rollback, "ready-token rollback failed");
                }
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    /// [`Arena::consume`] with a zero wait.
    pub fn try_consume(&self) -> Result<RecordBatch> {
        self.consume(Some(Duration::ZERO))
    }

    /// Wait for the next published slot and copy its raw frame out.
    pub fn consume_bytes(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let (index, len) = self.begin_consume("consume_bytes", timeout)?;
        let frame = unsafe { self.slot_span(index, len) };
        let payload = Bytes::copy_from_slice(frame);
        self.finish_consume(index, len)?;
        Ok(payload)
    }

    /// Probe for available data without consuming it.
    ///
    /// On success the `ready` token is immediately re-posted. Purely
    /// advisory: with other consumers attached, the slot may be gone before
    /// a follow-up `consume`.
    pub fn wait_for_data(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_role(Role::Consumer, "wait_for_data")?;
        match self.ready_sem.wait_opt(timeout) {
            Ok(()) => self.ready_sem.post(),
            Err(ArenaError::Timeout) => {
                self.stats.record_timeout();
                Err(ArenaError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a raw `ready` token for an out-of-band wakeup.
    ///
    /// Under normal single-producer operation consumers never call this.
    pub fn notify_data_ready(&self) -> Result<()> {
        self.ready_sem.post()
    }

    /// Signal end-of-stream: clears `writer_active` without tearing the
    /// region down, letting consumers drain the ring and then observe the
    /// timeout + inactive condition.
    pub fn finish(&self) -> Result<()> {
        self.ensure_role(Role::Producer, "finish")?;
        self.header().writer_active.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether a producer is currently attached (and not finished).
    pub fn writer_active(&self) -> bool {
        self.header().writer_active.load(Ordering::Acquire)
    }

    /// Number of consumers currently attached to the region.
    pub fn reader_count(&self) -> i32 {
        self.header().reader_count.load(Ordering::Acquire)
    }

    /// Count of successful publishes since the region was created.
    pub fn write_sequence(&self) -> u64 {
        self.header().write_sequence.load(Ordering::Acquire)
    }

    /// Count of successful consumes since the region was created.
    pub fn read_sequence(&self) -> u64 {
        self.header().read_sequence.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Snapshot of this handle's counters.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Most recent error surfaced by this handle, if any.
    pub fn last_error(&self) -> Option<String> {
        self.stats.last_error()
    }

    /// Tear the handle down.
    ///
    /// The producer clears `writer_active` and unlinks the region and both
    /// semaphore names; consumers decrement `reader_count` and only close
    /// their own handles. Errors during close are logged and swallowed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.role {
            Role::Producer => {
                self.header().writer_active.store(false, Ordering::Release);
            }
            Role::Consumer => {
                self.header().reader_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.free_sem.close();
        self.ready_sem.close();
        self.region.close();

        debug!(name = %self.name, role = self.role.as_str(), "closed arena handle");
    }

    // ---- internal ----

    fn header(&self) -> &RegionHeader {
        // Safety: the mapping outlives the handle and is at least
        // header-sized (checked at attach).
        unsafe { &*(self.region.as_ptr() as *const RegionHeader) }
    }

    fn slot_state(&self, index: usize) -> &SlotState {
        debug_assert!(index < self.geometry.buffer_count);
        // Safety: the slot table lies inside the validated header block.
        unsafe {
            let table = self.region.as_ptr().add(size_of::<RegionHeader>()) as *const SlotState;
            &*table.add(index)
        }
    }

    fn write_index(&self) -> usize {
        (self.header().write_sequence.load(Ordering::Acquire) % self.geometry.buffer_count as u64)
            as usize
    }

    fn read_index(&self) -> usize {
        (self.header().read_sequence.load(Ordering::Acquire) % self.geometry.buffer_count as u64)
            as usize
    }

    /// Flip slot `index` to published and release a `ready` token.
    fn publish(&self, index: usize, len: usize) -> Result<()> {
        let slot = self.slot_state(index);
        slot.data_size.store(len as u64, Ordering::Release);
        slot.timestamp.store(monotonic_micros(), Ordering::Relaxed);
        // Release pairs with the consumer's acquire load of `ready`: the
        // payload bytes and data_size are visible before the flag.
        slot.ready.store(true, Ordering::Release);
        self.header().write_sequence.fetch_add(1, Ordering::Release);
        self.ready_sem.post()
    }

    /// Take a `ready` token and locate the slot it covers.
    fn begin_consume(&self, op: &'static str, timeout: Option<Duration>) -> Result<(usize, usize)> {
        self.ensure_role(Role::Consumer, op)?;

        match self.ready_sem.wait_opt(timeout) {
            Ok(()) => {}
            Err(ArenaError::Timeout) => {
                self.stats.record_timeout();
                return Err(ArenaError::Timeout);
            }
            Err(e) => {
                self.stats.record_error(&e);
                return Err(e);
            }
        }

        let index = self.read_index();
        let slot = self.slot_state(index);
        if !slot.ready.load(Ordering::Acquire) {
            // Token and flag disagree. Rebalance towards the producer and
            // surface it as corruption.
            if let Err(rollback) = self.free_sem.post() {
                warn!(name = %self.name, error = %rollback, "free-token rebalance failed");
            }
            let e = ArenaError::InconsistentState(format!(
                "slot {index} not ready after token acquisition"
            ));
            self.stats.record_error(&e);
            return Err(e);
        }

        let len = slot.data_size.load(Ordering::Acquire) as usize;
        if len == 0 || len > self.geometry.buffer_size {
            if let Err(rollback) = self.free_sem.post() {
                warn!(name = %self.name, error = %rollback, "free-token rebalance failed");
            }
            let e = ArenaError::InconsistentState(format!(
                "slot {index} published with size {len}, capacity {}",
                self.geometry.buffer_size
            ));
            self.stats.record_error(&e);
            return Err(e);
        }

        Ok((index, len))
    }

    /// Mark slot `index` empty, advance the ring, release a `free` token.
    fn finish_consume(&self, index: usize, len: usize) -> Result<()> {
        let slot = self.slot_state(index);
        slot.ready.store(false, Ordering::Release);
        self.header().read_sequence.fetch_add(1, Ordering::Release);
        self.free_sem.post()?;
        self.stats.record_read(len);
        debug!(name = %self.name, slot = index, bytes = len, "consumed batch");
        Ok(())
    }

    /// Immutable view of `len` published bytes in slot `index`.
    ///
    /// # Safety
    ///
    /// Caller must hold the `ready` token for this slot.
    unsafe fn slot_span(&self, index: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(
            self.region.as_ptr().add(self.geometry.slot_offset(index)),
            len,
        )
    }

    /// Mutable view of slot `index`'s full capacity.
    ///
    /// # Safety
    ///
    /// Caller must hold the `free` token for this slot; the producer is the
    /// only writer.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_span_mut(&self, index: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.region.as_ptr().add(self.geometry.slot_offset(index)),
            self.geometry.buffer_size,
        )
    }

    /// A finished stream never publishes again: consumers treat
    /// "timeout while inactive" as end-of-stream, and a late publish would
    /// silently break that contract.
    fn ensure_active(&self) -> Result<()> {
        if self.writer_active() {
            Ok(())
        } else {
            Err(ArenaError::InconsistentState(
                "produce on a finished stream".to_string(),
            ))
        }
    }

    fn ensure_role(&self, required: Role, op: &'static str) -> Result<()> {
        if self.role == required {
            Ok(())
        } else {
            Err(ArenaError::WrongRole {
                op,
                role: self.role.as_str(),
            })
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("geometry", &self.geometry)
            .finish()
    }
}

fn monotonic_micros() -> u64 {
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000)
        .unwrap_or(0)
}
