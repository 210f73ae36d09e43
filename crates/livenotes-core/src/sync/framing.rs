//! Push-path framing for the primary radio transport
//!
//! Notifications have a hard per-message ceiling (512 bytes). Two behaviors
//! are available, selected by [`PayloadMode`]:
//!
//! - **Truncate** (default): an oversize snapshot is cut at the ceiling and
//!   sent as one notification. The receiver's decode fails and the
//!   message is dropped.
//! - **Chunked**: an oversize snapshot is split into sequenced frames and
//!   reassembled by the receiver. Payloads that fit are still sent raw, so a
//!   chunking hub interoperates with a non-chunking satellite for small datasets.
//!
//! ## Chunk frame
//!
//! ```text
//! +-------+-----+-------+-------+----------------------+
//! | magic | seq | index | count | body (<= ceiling-4)  |
//! | 0xFE  | u8  | u8    | u8    |                      |
//! +-------+-----+-------+-------+----------------------+
//! ```
//!
//! JSON never starts with `0xFE`, so raw and chunked frames are distinguishable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Per-notification ceiling for pushes
pub const DEFAULT_PAYLOAD_CEILING: usize = 512;

/// First byte of a chunk frame
pub const CHUNK_MAGIC: u8 = 0xFE;

/// Bytes of header in front of each chunk body
pub const CHUNK_HEADER_LEN: usize = 4;

/// How oversize push payloads are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Cut at the ceiling (default, lossy)
    #[default]
    Truncate,
    /// Split into sequenced frames
    Chunked,
}

/// Splits push payloads according to the configured mode
#[derive(Debug)]
pub struct PushFramer {
    mode: PayloadMode,
    ceiling: usize,
    next_seq: u8,
}

impl PushFramer {
    pub fn new(mode: PayloadMode, ceiling: usize) -> Self {
        Self {
            mode,
            ceiling: ceiling.max(CHUNK_HEADER_LEN + 1),
            next_seq: 0,
        }
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Produce the notification frames for one payload.
    ///
    /// # Errors
    ///
    /// `SyncError::Protocol` in chunked mode when the payload needs more than
    /// 255 frames.
    pub fn frame(&mut self, payload: &[u8]) -> SyncResult<Vec<Bytes>> {
        if payload.len() <= self.ceiling {
            return Ok(vec![Bytes::copy_from_slice(payload)]);
        }

        match self.mode {
            PayloadMode::Truncate => {
                warn!(
                    size = payload.len(),
                    ceiling = self.ceiling,
                    "Payload exceeds push ceiling, truncating"
                );
                Ok(vec![Bytes::copy_from_slice(&payload[..self.ceiling])])
            }
            PayloadMode::Chunked => {
                let body_len = self.ceiling - CHUNK_HEADER_LEN;
                let count = payload.len().div_ceil(body_len);
                if count > u8::MAX as usize {
                    return Err(SyncError::Protocol(format!(
                        "payload of {} bytes needs {} chunks (max {})",
                        payload.len(),
                        count,
                        u8::MAX
                    )));
                }

                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                debug!(size = payload.len(), seq, count, "Chunking push payload");

                Ok(payload
                    .chunks(body_len)
                    .enumerate()
                    .map(|(index, body)| {
                        let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
                        frame.extend_from_slice(&[CHUNK_MAGIC, seq, index as u8, count as u8]);
                        frame.extend_from_slice(body);
                        Bytes::from(frame)
                    })
                    .collect())
            }
        }
    }
}

/// Receiver-side reassembly of chunked pushes.
///
/// Raw (unframed) notifications pass straight through. A frame from a new
/// sequence discards any partially received message.
#[derive(Debug, Default)]
pub struct Reassembler {
    seq: Option<u8>,
    parts: Vec<Option<Bytes>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notification; returns a complete payload when one is available.
    pub fn accept(&mut self, frame: Bytes) -> Option<Bytes> {
        if frame.first() != Some(&CHUNK_MAGIC) {
            self.reset();
            return Some(frame);
        }
        if frame.len() < CHUNK_HEADER_LEN {
            warn!(len = frame.len(), "Dropping short chunk frame");
            return None;
        }

        let (seq, index, count) = (frame[1], frame[2] as usize, frame[3] as usize);
        if count == 0 || index >= count {
            warn!(seq, index, count, "Dropping malformed chunk frame");
            return None;
        }
        if self.seq != Some(seq) || self.parts.len() != count {
            if self.seq.is_some() && self.seq != Some(seq) {
                debug!(old = ?self.seq, new = seq, "Discarding incomplete chunked message");
            }
            self.seq = Some(seq);
            self.parts = vec![None; count];
        }
        self.parts[index] = Some(frame.slice(CHUNK_HEADER_LEN..));

        if self.parts.iter().all(Option::is_some) {
            let total = self.parts.iter().flatten().map(Bytes::len).sum();
            let mut out = Vec::with_capacity(total);
            for part in self.parts.drain(..).flatten() {
                out.extend_from_slice(&part);
            }
            self.seq = None;
            return Some(Bytes::from(out));
        }
        None
    }

    fn reset(&mut self) {
        self.seq = None;
        self.parts.clear();
    }
}

/// Suffix of `payload` starting at `offset`, or empty when past the end.
///
/// Serves offset reads on the data channel, where each read call is limited
/// in size and the reader advances the offset until it gets an empty slice.
pub fn read_at_offset(payload: &[u8], offset: usize) -> Bytes {
    if offset >= payload.len() {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&payload[offset..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_sent_raw_in_both_modes() {
        for mode in [PayloadMode::Truncate, PayloadMode::Chunked] {
            let mut framer = PushFramer::new(mode, 512);
            let frames = framer.frame(b"{\"notes\":[]}").unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(&frames[0][..], b"{\"notes\":[]}");
        }
    }

    #[test]
    fn test_truncate_cuts_at_ceiling() {
        let mut framer = PushFramer::new(PayloadMode::Truncate, 512);
        let payload = vec![b'x'; 700];
        let frames = framer.frame(&payload).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 512);
    }

    #[test]
    fn test_chunked_reassembles() {
        let mut framer = PushFramer::new(PayloadMode::Chunked, 512);
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let frames = framer.frame(&payload).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= 512));

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(frames[0].clone()).is_none());
        assert!(reassembler.accept(frames[1].clone()).is_none());
        let out = reassembler.accept(frames[2].clone()).unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn test_new_sequence_discards_partial() {
        let mut framer = PushFramer::new(PayloadMode::Chunked, 16);
        let first = framer.frame(&[1u8; 30]).unwrap();
        let second = framer.frame(&[2u8; 30]).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(first[0].clone()).is_none());
        let mut result = None;
        for frame in second {
            result = reassembler.accept(frame);
        }
        assert_eq!(&result.unwrap()[..], &[2u8; 30][..]);
    }

    #[test]
    fn test_chunk_limit() {
        let mut framer = PushFramer::new(PayloadMode::Chunked, 8);
        assert!(framer.frame(&vec![0u8; 4 * 300]).is_err());
    }

    #[test]
    fn test_read_at_offset() {
        let payload = b"0123456789";
        assert_eq!(&read_at_offset(payload, 0)[..], b"0123456789");
        assert_eq!(&read_at_offset(payload, 4)[..], b"456789");
        assert!(read_at_offset(payload, 10).is_empty());
        assert!(read_at_offset(payload, 99).is_empty());
    }
}
