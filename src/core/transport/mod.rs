// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event transport.
//!
//! Events travel to a client as length-prefixed bincode frames over any
//! reliable ordered byte stream. [`StreamTransport`] and [`ChannelTransport`]
//! are listeners that push delivered events onto a stream or an in-process
//! channel; [`FrameReader`] and [`TransportReceiver`] are the client ends,
//! which skip redelivered sequence numbers.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::core::error::{CacheError, CacheResult};
use crate::core::event::CacheEvent;
use crate::core::listener::{EventListener, ListenerResult};
use crate::core::queue::{SequenceCheck, SequenceTracker};
use crate::core::util::{from_bytes, to_bytes};

/// Frames larger than this are rejected when reading
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode_event(event: &CacheEvent) -> CacheResult<Vec<u8>> {
    to_bytes(event).map_err(|e| CacheError::other(format!("failed to encode event: {e}")))
}

pub fn decode_event(bytes: &[u8]) -> CacheResult<CacheEvent> {
    from_bytes(bytes).map_err(|e| CacheError::other(format!("failed to decode event: {e}")))
}

/// Write one `u32` big-endian length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, event: &CacheEvent) -> CacheResult<()> {
    let payload = encode_event(event)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CacheError::other(format!("frame of {} bytes is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> CacheResult<Option<CacheEvent>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CacheError::other(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_event(&payload).map(Some)
}

/// Listener that writes every delivered event to a byte stream.
pub struct StreamTransport<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> EventListener for StreamTransport<W> {
    fn on_event(&self, event: &CacheEvent) -> ListenerResult {
        let mut writer = self.writer.lock().expect("transport writer poisoned");
        write_frame(&mut *writer, event)?;
        Ok(())
    }
}

/// Client side of a byte stream: decodes frames, skipping duplicates.
pub struct FrameReader<R: Read> {
    reader: R,
    tracker: SequenceTracker,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            tracker: SequenceTracker::new(),
        }
    }

    /// Resume after a sequence number the client already processed.
    pub fn resume_after(reader: R, last_seen: u64) -> Self {
        Self {
            reader,
            tracker: SequenceTracker::starting_after(last_seen),
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.tracker.last_seen()
    }

    /// Next event not seen before, or `None` at end of stream.
    pub fn next_event(&mut self) -> CacheResult<Option<CacheEvent>> {
        while let Some(event) = read_frame(&mut self.reader)? {
            if accept(&mut self.tracker, &event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn accept(tracker: &mut SequenceTracker, event: &CacheEvent) -> bool {
    match tracker.observe(event.sequence) {
        SequenceCheck::Fresh => true,
        SequenceCheck::Duplicate => {
            log::debug!("skipping redelivered event #{}", event.sequence);
            false
        }
        SequenceCheck::Gap { expected } => {
            log::warn!(
                "event stream gap: expected #{expected}, received #{}",
                event.sequence
            );
            true
        }
    }
}

/// In-process transport over a crossbeam channel of encoded frames.
pub struct ChannelTransport {
    sender: Sender<Vec<u8>>,
}

impl ChannelTransport {
    /// A transport and its receiving end. `capacity` bounds the number of
    /// in-flight frames; `None` is unbounded.
    pub fn new(capacity: Option<usize>) -> (Self, TransportReceiver) {
        let (sender, receiver) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        (
            Self { sender },
            TransportReceiver {
                receiver,
                tracker: SequenceTracker::new(),
            },
        )
    }
}

impl EventListener for ChannelTransport {
    fn on_event(&self, event: &CacheEvent) -> ListenerResult {
        let frame = encode_event(event)?;
        self.sender
            .send(frame)
            .map_err(|_| CacheError::listener_fault("transport receiver disconnected"))?;
        Ok(())
    }
}

pub struct TransportReceiver {
    receiver: Receiver<Vec<u8>>,
    tracker: SequenceTracker,
}

impl TransportReceiver {
    /// Wait up to `timeout` for the next event not seen before.
    /// Returns `None` on timeout or once the transport is dropped.
    pub fn recv_timeout(&mut self, timeout: Duration) -> CacheResult<Option<CacheEvent>> {
        loop {
            match self.receiver.recv_timeout(timeout) {
                Ok(frame) => {
                    let event = decode_event(&frame)?;
                    if accept(&mut self.tracker, &event) {
                        return Ok(Some(event));
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(None)
                }
            }
        }
    }

    /// Every event already in the channel.
    pub fn drain(&mut self) -> CacheResult<Vec<CacheEvent>> {
        let mut events = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            let event = decode_event(&frame)?;
            if accept(&mut self.tracker, &event) {
                events.push(event);
            }
        }
        Ok(events)
    }
}
