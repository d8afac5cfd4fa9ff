//! Recovers RTU frame boundaries from an unframed byte stream.
//!
//! A serial-to-TCP gateway forwards bus traffic in arbitrary chunks, so one
//! TCP read may hold half a frame or several frames glued together. RTU has
//! no length prefix and no start marker; the only oracle is the CRC. The
//! [`Reframer`] therefore tries every window length at the front of its
//! buffer, shortest first, and accepts the first window that decodes into a
//! request or a response. When nothing matches, the first byte is dropped.
//!
//! A byte is only dropped once the buffer holds enough data to rule out a
//! frame starting at the front, so feeding the same stream in one chunk or in
//! many yields the same frames.

use crate::protocol::{self as proto, Frame};
use tokio_modbus::FunctionCode;

/// Maximum number of emit/discard steps performed by one call to [`Reframer::process`].
pub const MAX_ITERATIONS: usize = 100;

/// Smallest Read Coils / Read Holding Registers frame (a request).
const MIN_READ_FRAME_LEN: usize = 8;
/// Slave id, function code, byte count and CRC around the data of a response.
const RESPONSE_OVERHEAD: usize = 5;

/// Outcome of one processing pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Batch {
    /// Frames in the order they were taken off the buffer.
    pub frames: Vec<Frame>,
    /// Number of bytes dropped without producing a frame.
    pub discarded: usize,
    /// The iteration cap stopped the pass while more work may be possible.
    pub exhausted: bool,
}

/// Append-only byte buffer that yields CRC-validated frames from its front.
#[derive(Debug, Default)]
pub struct Reframer {
    buffer: Vec<u8>,
}

impl Reframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops all buffered bytes, e.g. when the transport reconnects.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Appends newly received bytes without processing them.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends `data` and runs one processing pass.
    pub fn push(&mut self, data: &[u8]) -> Batch {
        self.extend(data);
        self.process()
    }

    /// Takes frames off the front of the buffer.
    ///
    /// Runs at most [`MAX_ITERATIONS`] steps, each either emitting a frame or
    /// discarding one byte. Stops early when fewer than
    /// [`proto::MIN_FRAME_LEN`] bytes are left or when the front needs more
    /// data before it can be decided.
    pub fn process(&mut self) -> Batch {
        let mut batch = Batch::default();
        let mut iterations = 0;

        while self.buffer.len() >= proto::MIN_FRAME_LEN && iterations < MAX_ITERATIONS {
            if let Some((frame, len)) = self.front_frame() {
                self.buffer.drain(..len);
                batch.frames.push(frame);
            } else if self.buffer.len() >= self.settle_len() {
                self.buffer.remove(0);
                batch.discarded += 1;
            } else {
                break;
            }
            iterations += 1;
        }

        batch.exhausted =
            iterations >= MAX_ITERATIONS && self.buffer.len() >= proto::MIN_FRAME_LEN;
        batch
    }

    /// Shortest window at the front that decodes into a request or response.
    fn front_frame(&self) -> Option<(Frame, usize)> {
        let longest = self.buffer.len().min(proto::MAX_FRAME_LEN);
        (proto::MIN_FRAME_LEN..=longest).find_map(|len| {
            proto::decode(&self.buffer[..len])
                .filter(Frame::is_classified)
                .map(|frame| (frame, len))
        })
    }

    /// Buffer length at which a failed search at the front is final.
    ///
    /// Only read functions classify, so any other function code can be
    /// dropped at once. For reads the canonical frame length is known from
    /// the header: 8 bytes for a request, byte count + 5 for a response.
    ///
    /// A corrupted read header therefore holds back the frames behind it
    /// until up to [`proto::MAX_FRAME_LEN`] bytes are buffered. Held frames
    /// are lost if the buffer is cleared first.
    fn settle_len(&self) -> usize {
        match FunctionCode::new(self.buffer[1]) {
            FunctionCode::ReadCoils | FunctionCode::ReadHoldingRegisters => {
                (usize::from(self.buffer[2]) + RESPONSE_OVERHEAD)
                    .clamp(MIN_READ_FRAME_LEN, proto::MAX_FRAME_LEN)
            }
            _ => proto::MIN_FRAME_LEN,
        }
    }
}
