//! Async adaptors over the blocking arena (`async` feature)
//!
//! The core transport is blocking by design; these wrappers move each call
//! onto the tokio blocking pool so async services can share a ring without
//! stalling their reactor.

use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use bytes::Bytes;

use crate::{Arena, ArenaError, Result, Stats};

/// Shared async handle over a blocking [`Arena`].
#[derive(Clone, Debug)]
pub struct AsyncArena {
    inner: Arc<Arena>,
}

impl AsyncArena {
    pub fn new(arena: Arena) -> Self {
        Self {
            inner: Arc::new(arena),
        }
    }

    /// Publish a batch from the blocking pool.
    pub async fn produce(&self, batch: RecordBatch) -> Result<()> {
        let arena = Arc::clone(&self.inner);
        spawn(move || arena.produce(&batch)).await
    }

    /// Publish a raw payload from the blocking pool.
    pub async fn produce_bytes(&self, payload: Bytes) -> Result<()> {
        let arena = Arc::clone(&self.inner);
        spawn(move || arena.produce_bytes(&payload)).await
    }

    /// Consume the next batch from the blocking pool.
    pub async fn consume(&self, timeout: Option<Duration>) -> Result<RecordBatch> {
        let arena = Arc::clone(&self.inner);
        spawn(move || arena.consume(timeout)).await
    }

    /// Consume the next raw frame from the blocking pool.
    pub async fn consume_bytes(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let arena = Arc::clone(&self.inner);
        spawn(move || arena.consume_bytes(timeout)).await
    }

    /// Signal end-of-stream (producer handles only).
    pub async fn finish(&self) -> Result<()> {
        let arena = Arc::clone(&self.inner);
        spawn(move || arena.finish()).await
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Borrow the blocking handle for non-blocking accessors.
    pub fn blocking(&self) -> &Arena {
        &self.inner
    }
}

async fn spawn<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        ArenaError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("blocking task failed: {e}"),
        ))
    })?
}
