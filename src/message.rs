//! Batching Message Socket (C5): frame encode/decode and opportunistic
//! coalescing of small writes into a single send work request (§4.5, wire
//! layout §6).

use std::sync::Mutex;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// One framed message, little-endian on the wire:
/// `{ message_id: u64, message_type: u32, length: u32, payload }`.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub message_id: u64,
    pub message_type: u32,
    pub payload: &'a [u8],
}

pub const HEADER_LEN: usize = 8 + 4 + 4;

pub fn encode_frame(buf: &mut Vec<u8>, frame: Frame<'_>) {
    buf.extend_from_slice(&frame.message_id.to_le_bytes());
    buf.extend_from_slice(&frame.message_type.to_le_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(frame.payload);
}

/// Decodes one frame from the front of `buf`. Returns the frame (borrowing
/// from `buf`) and the number of bytes consumed, or `None` if `buf` does not
/// yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Option<(Frame<'_>, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let message_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let message_type = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let length = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    let total = HEADER_LEN + length;
    if buf.len() < total {
        return None;
    }
    Some((
        Frame {
            message_id,
            message_type,
            payload: &buf[HEADER_LEN..total],
        },
        total,
    ))
}

/// Iterates every complete frame in `buf`, in wire order. A reader observes
/// each framed message exactly once, in send order (§4.5 contract).
pub fn decode_all(mut buf: &[u8]) -> Vec<(u64, u32, Vec<u8>)> {
    let mut frames = Vec::new();
    while let Some((frame, consumed)) = decode_frame(buf) {
        frames.push((frame.message_id, frame.message_type, frame.payload.to_vec()));
        buf = &buf[consumed..];
    }
    frames
}

/// Coalesces frames into a single send buffer up to `max_batch_size` bytes.
pub struct Batcher {
    max_batch_size: usize,
    pending: Vec<u8>,
}

impl Batcher {
    pub fn new(max_batch_size: usize) -> Batcher {
        Batcher {
            max_batch_size,
            pending: Vec::new(),
        }
    }

    /// Appends `frame`. If appending it would exceed the batch capacity,
    /// the current batch is flushed first and returned, with `frame`
    /// starting the next one.
    pub fn push(&mut self, frame: Frame<'_>) -> Option<Vec<u8>> {
        let framed_len = HEADER_LEN + frame.payload.len();
        let flushed = if !self.pending.is_empty() && self.pending.len() + framed_len > self.max_batch_size {
            self.flush()
        } else {
            None
        };
        encode_frame(&mut self.pending, frame);
        flushed
    }

    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Frames, batches, and hands messages to a [`Connection`]. Flushed at
/// end-of-batch boundaries by the event loop's task-queue drain hook, not
/// by a timer (§4.5).
pub struct MessageSocket {
    connection: Connection,
    batcher: Mutex<Batcher>,
}

impl MessageSocket {
    pub fn new(connection: Connection, max_batch_size: usize) -> MessageSocket {
        MessageSocket {
            connection,
            batcher: Mutex::new(Batcher::new(max_batch_size)),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn send_message(&self, message_id: u64, message_type: u32, payload: &[u8]) -> Result<()> {
        if !self.connection.state().is_connected() {
            return Err(Error::InvalidArgument(
                "send_message is only valid while connected".into(),
            ));
        }
        let frame = Frame {
            message_id,
            message_type,
            payload,
        };
        let flushed = self.batcher.lock().unwrap().push(frame);
        if let Some(batch) = flushed {
            self.post(batch)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let flushed = self.batcher.lock().unwrap().flush();
        if let Some(batch) = flushed {
            self.post(batch)?;
        }
        Ok(())
    }

    fn post(&self, batch: Vec<u8>) -> Result<()> {
        let mut buf = self
            .connection
            .completion()
            .send_pool()
            .lock()
            .unwrap()
            .acquire(batch.len())?;
        buf.as_mut_slice()[..batch.len()].copy_from_slice(&batch);
        self.connection.send(buf, batch.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        encode_frame(
            &mut buf,
            Frame {
                message_id: 0x1234_5678_9abc_def0,
                message_type: 7,
                payload: b"ping",
            },
        );
        let (frame, consumed) = decode_frame(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(frame.message_id, 0x1234_5678_9abc_def0);
        assert_eq!(frame.message_type, 7);
        assert_eq!(frame.payload, b"ping");
    }

    #[test]
    fn decode_frame_needs_full_payload() {
        let mut buf = Vec::new();
        encode_frame(
            &mut buf,
            Frame {
                message_id: 1,
                message_type: 1,
                payload: b"hello",
            },
        );
        buf.truncate(buf.len() - 1);
        assert!(decode_frame(&buf).is_none());
    }

    #[test]
    fn batcher_flushes_on_overflow() {
        let mut batcher = Batcher::new(HEADER_LEN + 4);
        assert!(batcher
            .push(Frame {
                message_id: 1,
                message_type: 1,
                payload: b"abcd",
            })
            .is_none());
        let flushed = batcher
            .push(Frame {
                message_id: 2,
                message_type: 1,
                payload: b"efgh",
            })
            .expect("second push should flush the first frame");
        let frames = decode_all(&flushed);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 1);
    }

    #[test]
    fn multiple_frames_preserve_boundaries_in_send_order() {
        let mut batcher = Batcher::new(4096);
        batcher.push(Frame {
            message_id: 1,
            message_type: 1,
            payload: b"a",
        });
        batcher.push(Frame {
            message_id: 2,
            message_type: 1,
            payload: b"bb",
        });
        let batch = batcher.flush().unwrap();
        let frames = decode_all(&batch);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[1].0, 2);
    }
}
