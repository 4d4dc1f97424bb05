//! Encoded frame type
//!
//! The unit broadcast to subscribers. `data` is `Bytes`, so every HTTP
//! session shares one allocation per frame.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use crate::capture::frame::Frame;

/// A JPEG frame plus the provenance needed for ordering and dedup
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG payload
    pub data: Bytes,

    pub width: u32,
    pub height: u32,

    /// Grab timestamp of the raw frame this was encoded from
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,

    /// Whether the source was live; false for offline placeholders
    pub online: bool,

    /// Position in the published sequence, assigned by the coordinator
    pub published_seq: u64,

    /// xxh3-64 of `data`, used by drop-same dedup
    pub hash: u64,

    /// Ring slot this frame came from
    pub slot_index: usize,
    /// Slot generation at claim time
    pub generation: u64,
}

impl EncodedFrame {
    /// Build from a worker's compression output
    pub fn from_encode(
        jpeg: &[u8],
        raw: &Frame,
        slot_index: usize,
        generation: u64,
        encode_begin_ts: f64,
        encode_end_ts: f64,
    ) -> Self {
        Self {
            data: Bytes::copy_from_slice(jpeg),
            width: raw.width,
            height: raw.height,
            grab_ts: raw.grab_ts,
            encode_begin_ts,
            encode_end_ts,
            online: true,
            published_seq: 0,
            hash: xxh3_64(jpeg),
            slot_index,
            generation,
        }
    }

    /// Build a synthetic frame not originating from the ring
    /// (offline placeholders)
    pub fn synthetic(jpeg: Bytes, width: u32, height: u32, grab_ts: f64, online: bool) -> Self {
        let hash = xxh3_64(&jpeg);
        Self {
            data: jpeg,
            width,
            height,
            grab_ts,
            encode_begin_ts: grab_ts,
            encode_end_ts: grab_ts,
            online,
            published_seq: 0,
            hash,
            slot_index: 0,
            generation: 0,
        }
    }

    /// Encode-to-publish latency in seconds
    pub fn encode_duration(&self) -> f64 {
        (self.encode_end_ts - self.encode_begin_ts).max(0.0)
    }
}
