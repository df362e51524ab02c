//! qads — single-producer / multi-consumer shared-memory transport for
//! Arrow record batches
//!
//! A producer serializes record batches into a bounded ring of fixed-size
//! slots inside a POSIX shared-memory region; any number of consumers, in
//! any language that speaks the layout, pull them back with one copy.
//! Pacing is two kernel-named counting semaphores: `free` tokens count
//! empty slots, `ready` tokens count published ones. Each published frame
//! is a self-describing Arrow IPC stream, so the ring carries heterogeneous
//! schemas without any schema state in the header.
//!
//! ```no_run
//! use qads::{Arena, BatchStream};
//! # fn batch() -> arrow::record_batch::RecordBatch { unimplemented!() }
//!
//! // Producer process
//! let producer = Arena::attach_producer("ticks", 64 * 1024 * 1024, 4)?;
//! producer.produce(&batch())?;
//! producer.finish()?;
//!
//! // Consumer process
//! let consumer = Arena::attach_consumer("ticks")?;
//! for batch in BatchStream::new(consumer)? {
//!     let batch = batch?;
//!     println!("{} rows", batch.num_rows());
//! }
//! # Ok::<(), qads::ArenaError>(())
//! ```

#[cfg(not(unix))]
compile_error!("qads requires POSIX shared memory and named semaphores");

// The control block lives in memory shared across processes; its atomics
// must be lock-free machine words with a fixed layout.
#[cfg(not(target_has_atomic = "64"))]
compile_error!("qads requires lock-free 64-bit atomics");

pub mod arena;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod region;
pub mod stats;
pub mod stream;
pub mod sync;
#[cfg(feature = "async")]
pub mod task;

pub use arena::{Arena, ArenaConfig, Role};
pub use error::{ArenaError, Result};
pub use protocol::{Geometry, RegionHeader, SlotState, CACHE_LINE, MAGIC, PROTOCOL_VERSION};
pub use stats::Stats;
pub use stream::BatchStream;
#[cfg(feature = "async")]
pub use task::AsyncArena;

/// Default region size (64 MiB)
pub const DEFAULT_TOTAL_SIZE: usize = 64 * 1024 * 1024;

/// Default ring depth
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Create a region named `name` and attach as its producer.
pub fn producer(name: &str, total_size: usize, buffer_count: usize) -> Result<Arena> {
    Arena::attach_producer(name, total_size, buffer_count)
}

/// Attach to the region named `name` as a consumer.
pub fn consumer(name: &str) -> Result<Arena> {
    Arena::attach_consumer(name)
}
