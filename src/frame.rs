//! Sentinel-terminated framing over a TCP byte stream.
//!
//! A frame is an opaque byte sequence followed by the five-byte ASCII
//! sentinel `<END>`. Reads are never assumed to align with frame boundaries:
//! the decoder buffers partial input and may yield zero, one, or several
//! frames per read. The encoder refuses payloads that contain the sentinel
//! rather than trusting callers to only hand it base64 material.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame terminator.
pub const SENTINEL: &[u8] = b"<END>";

/// Default upper bound on a single frame, sentinel excluded.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Errors emitted while splitting or emitting frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {0} bytes without a terminator")]
    Oversize(usize),
    #[error("payload contains the frame sentinel")]
    SentinelInPayload,
}

/// Codec splitting a byte stream into `<END>`-terminated frames.
#[derive(Debug)]
pub struct SentinelCodec {
    max_len: usize,
    // Bytes already scanned without finding a sentinel; lets a long frame
    // arriving in many small reads avoid a quadratic rescan.
    scanned: usize,
}

impl SentinelCodec {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }
}

impl Default for SentinelCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_sentinel(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < SENTINEL.len() {
        return None;
    }
    (from..=buf.len() - SENTINEL.len()).find(|&i| &buf[i..i + SENTINEL.len()] == SENTINEL)
}

impl Decoder for SentinelCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let resume = self.scanned.saturating_sub(SENTINEL.len() - 1);
        match find_sentinel(src, resume) {
            Some(pos) => {
                if pos > self.max_len {
                    return Err(FrameError::Oversize(self.max_len));
                }
                let frame = src.split_to(pos).freeze();
                src.advance(SENTINEL.len());
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max_len + SENTINEL.len() {
                    return Err(FrameError::Oversize(self.max_len));
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for SentinelCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if find_sentinel(&item, 0).is_some() {
            return Err(FrameError::SentinelInPayload);
        }
        dst.reserve(item.len() + SENTINEL.len());
        dst.extend_from_slice(&item);
        dst.extend_from_slice(SENTINEL);
        Ok(())
    }
}
