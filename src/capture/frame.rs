//! Raw frame container and pixel formats
//!
//! A `Frame` owns its pixel buffer so ring slots can recycle the allocation
//! across refills. Timestamps are monotonic seconds taken from a
//! process-local clock, never wall time.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use serde::Serialize;

/// Pixel formats the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Rgb24,
    Bgr24,
    Jpeg,
    Mjpeg,
    H264,
    Grey,
}

impl PixelFormat {
    /// Bytes per pixel for packed raw formats, `None` for compressed ones
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Grey => Some(1),
            PixelFormat::Jpeg | PixelFormat::Mjpeg | PixelFormat::H264 => None,
        }
    }

    /// Whether this format is already a compressed bitstream
    pub fn is_compressed(self) -> bool {
        self.bytes_per_pixel().is_none()
    }

    /// Parse a format name as it appears on the command line
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "YUYV" => Some(PixelFormat::Yuyv),
            "UYVY" => Some(PixelFormat::Uyvy),
            "RGB24" => Some(PixelFormat::Rgb24),
            "BGR24" => Some(PixelFormat::Bgr24),
            "JPEG" => Some(PixelFormat::Jpeg),
            "MJPEG" => Some(PixelFormat::Mjpeg),
            "H264" => Some(PixelFormat::H264),
            "GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Canonical name used in logs and `/state`
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::H264 => "H264",
            PixelFormat::Grey => "GREY",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic timestamp in seconds since process start
pub fn monotonic_now() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs_f64()
}

/// An owned raw frame
///
/// Invariants: `used <= data.len()` after every refill, and for packed raw
/// formats `stride * height <= data.len()`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel payload; capacity is recycled across slot refills
    pub data: Vec<u8>,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Bytes per row (packed raw formats)
    pub stride: u32,

    /// Valid bytes in `data`
    pub used: usize,

    /// Monotonic seconds at the moment the driver handed the frame over
    pub grab_ts: f64,

    /// Monotonic seconds when compression started / finished
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,

    /// Whether the source was live when this frame was produced
    pub online: bool,

    /// Keyframe flag (video-coded formats)
    pub key: bool,

    /// GOP position, 0 for non-video-coded formats
    pub gop: u32,

    /// Opaque hardware buffer handle, when a platform driver provides one
    pub dma: Option<u64>,
}

impl Frame {
    /// Create an empty frame with no payload
    pub fn empty(format: PixelFormat) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            format,
            stride: 0,
            used: 0,
            grab_ts: 0.0,
            encode_begin_ts: 0.0,
            encode_end_ts: 0.0,
            online: true,
            key: false,
            gop: 0,
            dma: None,
        }
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Overwrite this frame's payload and header, reusing the allocation
    pub fn assign(
        &mut self,
        payload: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: u32,
        grab_ts: f64,
    ) {
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.used = payload.len();
        self.width = width;
        self.height = height;
        self.format = format;
        self.stride = stride;
        self.grab_ts = grab_ts;
        self.encode_begin_ts = 0.0;
        self.encode_end_ts = 0.0;
        self.online = true;
        self.key = false;
        self.gop = 0;
        self.dma = None;
    }

    /// Check the frame invariants hold for its declared geometry
    pub fn geometry_ok(&self) -> bool {
        if self.used > self.data.len() {
            return false;
        }
        match self.format.bytes_per_pixel() {
            Some(_) => (self.stride as usize) * (self.height as usize) <= self.data.len(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse_roundtrip() {
        for name in ["YUYV", "UYVY", "RGB24", "BGR24", "JPEG", "MJPEG", "H264", "GREY"] {
            let fmt = PixelFormat::parse(name).unwrap();
            assert_eq!(fmt.as_str(), name);
        }
        assert!(PixelFormat::parse("NV12").is_none());
        assert_eq!(PixelFormat::parse("yuyv"), Some(PixelFormat::Yuyv));
    }

    #[test]
    fn test_format_bpp() {
        assert_eq!(PixelFormat::Yuyv.bytes_per_pixel(), Some(2));
        assert_eq!(PixelFormat::Rgb24.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Grey.bytes_per_pixel(), Some(1));
        assert!(PixelFormat::Mjpeg.is_compressed());
        assert!(!PixelFormat::Bgr24.is_compressed());
    }

    #[test]
    fn test_assign_recycles_allocation() {
        let mut frame = Frame::empty(PixelFormat::Yuyv);
        frame.assign(&[0u8; 64], 4, 4, PixelFormat::Yuyv, 8, 1.0);
        let cap = frame.data.capacity();

        frame.assign(&[1u8; 32], 4, 2, PixelFormat::Yuyv, 8, 2.0);
        assert_eq!(frame.used, 32);
        assert_eq!(frame.data.capacity(), cap);
        assert!(frame.geometry_ok());
    }

    #[test]
    fn test_geometry_invariant() {
        let mut frame = Frame::empty(PixelFormat::Rgb24);
        frame.assign(&[0u8; 12], 2, 2, PixelFormat::Rgb24, 6, 0.0);
        assert!(frame.geometry_ok());

        // Declared geometry larger than the payload
        frame.height = 100;
        assert!(!frame.geometry_ok());
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
