//! Frame codec: one Arrow IPC stream per ring slot
//!
//! A published slot holds a complete, self-describing Arrow IPC stream —
//! schema, a single record batch, end marker — starting at slot byte 0.
//! Frames carry their own schema, so a ring can move heterogeneous batches
//! and the header stays a pure control block.

use std::io::{self, Cursor, Write};

use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::{ArenaError, Result};

/// Serialize `batch` as an IPC stream into `slot`, returning the frame
/// length.
///
/// The slot is a fixed-capacity linear buffer: if the stream would overflow
/// it, the write fails [`ArenaError::PayloadTooLarge`] and the slot contents
/// are garbage — callers must not publish after an error.
pub fn encode_batch(batch: &RecordBatch, slot: &mut [u8]) -> Result<usize> {
    let capacity = slot.len();
    let mut writer = StreamWriter::try_new(SlotWriter::new(slot), batch.schema().as_ref())
        .map_err(|e| map_write_error(e, capacity))?;
    writer
        .write(batch)
        .map_err(|e| map_write_error(e, capacity))?;
    writer.finish().map_err(|e| map_write_error(e, capacity))?;

    let inner = writer
        .into_inner()
        .map_err(|e| map_write_error(e, capacity))?;
    Ok(inner.written)
}

/// Deserialize the record batch from a published frame.
///
/// `frame` must be exactly the `data_size` bytes of the slot; bytes past
/// the frame are undefined and must not be handed to the reader.
pub fn decode_batch(frame: &[u8]) -> Result<RecordBatch> {
    let mut reader = StreamReader::try_new(Cursor::new(frame), None)?;
    match reader.next() {
        Some(batch) => Ok(batch?),
        None => Err(ArenaError::InconsistentState(
            "frame contained no record batch".to_string(),
        )),
    }
}

/// `io::Write` over a fixed slot span; refuses to grow past capacity.
struct SlotWriter<'a> {
    slot: &'a mut [u8],
    written: usize,
}

impl<'a> SlotWriter<'a> {
    fn new(slot: &'a mut [u8]) -> Self {
        Self { slot, written: 0 }
    }
}

impl Write for SlotWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let end = self.written + data.len();
        if end > self.slot.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                CapacityExceeded { attempted: end },
            ));
        }
        self.slot[self.written..end].copy_from_slice(data);
        self.written = end;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Carried inside the refusing `io::Error` so the frame size that broke the
/// capacity survives arrow's error wrapping.
#[derive(Debug)]
struct CapacityExceeded {
    attempted: usize,
}

impl std::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame of at least {} bytes exceeds slot capacity", self.attempted)
    }
}

impl std::error::Error for CapacityExceeded {}

fn map_write_error(err: ArrowError, capacity: usize) -> ArenaError {
    match &err {
        ArrowError::IoError(_, io_err) if io_err.kind() == io::ErrorKind::WriteZero => {
            let size = io_err
                .get_ref()
                .and_then(|e| e.downcast_ref::<CapacityExceeded>())
                .map_or(capacity, |e| e.attempted);
            ArenaError::PayloadTooLarge { size, capacity }
        }
        _ => ArenaError::Codec(err),
    }
}
