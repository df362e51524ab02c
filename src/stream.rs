//! Pull-style batch stream over a consumer arena

use std::time::Duration;

use arrow::record_batch::RecordBatch;

use crate::{Arena, ArenaError, Result, Role};

/// Default pull timeout when neither the stream nor the arena config set one.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_millis(100);

/// A stateful pull sequence of record batches.
///
/// End-of-stream is observed, never signalled in-band: a timed read that
/// expires while `writer_active` is false means the producer has finished
/// and the ring is drained.
pub struct BatchStream {
    arena: Arena,
    timeout: Duration,
    done: bool,
}

impl BatchStream {
    /// Wrap a consumer arena; fails [`ArenaError::WrongRole`] for producers.
    pub fn new(arena: Arena) -> Result<Self> {
        if arena.role() != Role::Consumer {
            return Err(ArenaError::WrongRole {
                op: "stream",
                role: arena.role().as_str(),
            });
        }
        let timeout = arena.default_timeout().unwrap_or(DEFAULT_PULL_TIMEOUT);
        Ok(Self {
            arena,
            timeout,
            done: false,
        })
    }

    /// Override the per-pull timeout used by the `Iterator` impl.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pull the next batch.
    ///
    /// `Ok(None)` is the end of the stream: the wait timed out and the
    /// producer is gone. A timeout while the producer is still active
    /// surfaces as [`ArenaError::Timeout`] so callers can keep polling.
    pub fn next_batch(&mut self, timeout: Option<Duration>) -> Result<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }
        match self.arena.consume(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(ArenaError::Timeout) if !self.arena.writer_active() => {
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether end-of-stream has been observed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn into_inner(self) -> Arena {
        self.arena
    }
}

impl Iterator for BatchStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch(Some(self.timeout)) {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl std::fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("arena", &self.arena)
            .field("timeout", &self.timeout)
            .field("done", &self.done)
            .finish()
    }
}
