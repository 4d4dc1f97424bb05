//! JPEG encoders
//!
//! `Encoder` is the capability boundary between the worker pool and the
//! compression backend. The CPU encoder is always available; the M2M and
//! platform variants delegate to an optional hardware backend supplied by
//! the host build and fall back to CPU per frame when the backend rejects
//! a geometry.

use std::fmt;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::EncoderError;

/// Default JPEG quality when none is configured
pub const DEFAULT_QUALITY: u8 = 80;

/// Encoder selection as it appears on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Cpu,
    M2mImage,
    M2mVideo,
    Hw,
}

impl EncoderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(EncoderKind::Cpu),
            "m2m-image" => Some(EncoderKind::M2mImage),
            "m2m-video" => Some(EncoderKind::M2mVideo),
            "hw" => Some(EncoderKind::Hw),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EncoderKind::Cpu => "cpu",
            EncoderKind::M2mImage => "m2m-image",
            EncoderKind::M2mVideo => "m2m-video",
            EncoderKind::Hw => "hw",
        }
    }

    /// Build one encoder instance of this kind
    ///
    /// Each worker gets its own instance; encoders are never shared.
    /// Without a registered platform backend the hardware kinds resolve to
    /// a CPU-backed implementation.
    pub fn build(self, quality: u8) -> Box<dyn Encoder> {
        match self {
            EncoderKind::Cpu => Box::new(CpuEncoder::new(quality)),
            EncoderKind::M2mImage | EncoderKind::M2mVideo | EncoderKind::Hw => {
                Box::new(HwEncoder::new(self, None, quality))
            }
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JPEG compressor owned by exactly one worker
pub trait Encoder: Send {
    /// Compress `src` into `dest` (cleared first)
    fn encode(&mut self, src: &Frame, dest: &mut Vec<u8>) -> Result<(), EncoderError>;

    /// The kind this encoder reports in `/state`
    fn kind(&self) -> EncoderKind;

    fn quality(&self) -> u8;
}

/// Software JPEG encoder
///
/// Deterministic: identical input and quality produce identical bytes,
/// which the coordinator's dedup relies on.
pub struct CpuEncoder {
    quality: u8,
    /// Scratch buffer for pixel format conversion, reused across frames
    rgb: Vec<u8>,
}

impl CpuEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            rgb: Vec::new(),
        }
    }

    /// Iterate rows with any stride padding dropped
    fn tight_rows<'a>(src: &'a Frame, bpp: usize) -> impl Iterator<Item = &'a [u8]> {
        let tight = src.width as usize * bpp;
        let stride = (src.stride as usize).max(tight);
        src.payload()
            .chunks(stride)
            .take(src.height as usize)
            .map(move |row| &row[..tight.min(row.len())])
    }
}

impl Encoder for CpuEncoder {
    fn encode(&mut self, src: &Frame, dest: &mut Vec<u8>) -> Result<(), EncoderError> {
        dest.clear();
        if src.used == 0 {
            return Err(EncoderError::Unsupported("empty frame".into()));
        }
        if !src.geometry_ok() {
            return Err(EncoderError::Unsupported(format!(
                "geometry {}x{} stride {} exceeds payload",
                src.width, src.height, src.stride
            )));
        }

        match src.format {
            // Already JPEG: pass the bitstream through untouched
            PixelFormat::Jpeg | PixelFormat::Mjpeg => {
                dest.extend_from_slice(src.payload());
                Ok(())
            }
            PixelFormat::H264 => Err(EncoderError::Unsupported(
                "H264 input needs a video-capable backend".into(),
            )),
            PixelFormat::Grey => {
                self.rgb.clear();
                for row in Self::tight_rows(src, 1) {
                    self.rgb.extend_from_slice(row);
                }
                write_jpeg(dest, &self.rgb, src.width, src.height, ExtendedColorType::L8, self.quality)
            }
            PixelFormat::Rgb24 => {
                self.rgb.clear();
                for row in Self::tight_rows(src, 3) {
                    self.rgb.extend_from_slice(row);
                }
                write_jpeg(dest, &self.rgb, src.width, src.height, ExtendedColorType::Rgb8, self.quality)
            }
            PixelFormat::Bgr24 => {
                self.rgb.clear();
                self.rgb
                    .reserve(src.width as usize * src.height as usize * 3);
                for row in Self::tight_rows(src, 3) {
                    for px in row.chunks_exact(3) {
                        self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
                write_jpeg(dest, &self.rgb, src.width, src.height, ExtendedColorType::Rgb8, self.quality)
            }
            PixelFormat::Yuyv | PixelFormat::Uyvy => {
                self.rgb.clear();
                self.rgb
                    .reserve(src.width as usize * src.height as usize * 3);
                let swap = src.format == PixelFormat::Uyvy;
                for row in Self::tight_rows(src, 2) {
                    for quad in row.chunks_exact(4) {
                        let (y0, u, y1, v) = if swap {
                            (quad[1], quad[0], quad[3], quad[2])
                        } else {
                            (quad[0], quad[1], quad[2], quad[3])
                        };
                        push_yuv_rgb(&mut self.rgb, y0, u, v);
                        push_yuv_rgb(&mut self.rgb, y1, u, v);
                    }
                }
                write_jpeg(dest, &self.rgb, src.width, src.height, ExtendedColorType::Rgb8, self.quality)
            }
        }
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::Cpu
    }

    fn quality(&self) -> u8 {
        self.quality
    }
}

/// Hardware encoder with per-frame CPU fallback
///
/// The platform backend is optional: hosts that link an M2M or GPU driver
/// install it here, everyone else runs on the fallback. A backend rejecting
/// a frame with `Unsupported` is not an error, the frame just takes the
/// CPU path.
pub struct HwEncoder {
    kind: EncoderKind,
    backend: Option<Box<dyn Encoder>>,
    fallback: CpuEncoder,
}

impl HwEncoder {
    pub fn new(kind: EncoderKind, backend: Option<Box<dyn Encoder>>, quality: u8) -> Self {
        Self {
            kind,
            backend,
            fallback: CpuEncoder::new(quality),
        }
    }
}

impl Encoder for HwEncoder {
    fn encode(&mut self, src: &Frame, dest: &mut Vec<u8>) -> Result<(), EncoderError> {
        if let Some(backend) = self.backend.as_mut() {
            match backend.encode(src, dest) {
                Ok(()) => return Ok(()),
                Err(EncoderError::Unsupported(reason)) => {
                    tracing::debug!(reason = %reason, "hardware encoder rejected frame, using cpu");
                }
                Err(e) => return Err(e),
            }
        }
        self.fallback.encode(src, dest)
    }

    fn kind(&self) -> EncoderKind {
        self.kind
    }

    fn quality(&self) -> u8 {
        self.fallback.quality()
    }
}

fn write_jpeg(
    dest: &mut Vec<u8>,
    pixels: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
    quality: u8,
) -> Result<(), EncoderError> {
    let expected = width as usize
        * height as usize
        * match color {
            ExtendedColorType::L8 => 1,
            _ => 3,
        };
    if pixels.len() < expected {
        return Err(EncoderError::Unsupported(format!(
            "payload {} bytes short of {}x{}",
            pixels.len(),
            width,
            height
        )));
    }

    JpegEncoder::new_with_quality(&mut *dest, quality)
        .encode(&pixels[..expected], width, height, color)
        .map_err(|e| EncoderError::Failed(e.to_string()))
}

fn push_yuv_rgb(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    // BT.601 integer conversion
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    out.extend_from_slice(&[
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]);
}
