//! Capture source abstraction
//!
//! The pipeline never talks to a camera API directly; platform drivers
//! (V4L2, AVFoundation, ...) implement `CaptureSource` and are selected by
//! the host build. The core only sees geometry, pixel format and bytes.
//!
//! `TestPatternSource` is a deterministic in-process source used by the
//! tests and by demo runs on machines without a camera.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::config::CaptureConfig;
use crate::capture::frame::{monotonic_now, PixelFormat};
use crate::error::SourceError;

/// Format actually applied by the source after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    /// Frames per second the source settled on (0 = unknown)
    pub fps: u32,
}

/// A raw frame as handed over by the driver
///
/// Borrowed from the source's internal buffer; the capturer copies it into
/// a ring slot before the next `grab` call.
#[derive(Debug)]
pub struct SourceFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    /// Monotonic seconds at the moment the driver produced the frame
    pub grab_ts: f64,
    pub sequence: u64,
}

/// Abstract capture device
///
/// Implementations own the device handle and must release it in `close`
/// and on drop.
pub trait CaptureSource: Send {
    /// Apply the requested configuration, returning what was actually set
    ///
    /// Unknown geometries fall back to the nearest the device supports.
    fn negotiate(&mut self, config: &CaptureConfig) -> Result<AppliedFormat, SourceError>;

    /// Block up to `timeout` for the next frame
    fn grab(&mut self, timeout: Duration) -> Result<SourceFrame<'_>, SourceError>;

    /// Release the device; idempotent
    fn close(&mut self);
}

/// Deterministic synthetic source producing a paced gradient pattern
///
/// Knobs let tests provoke every capturer edge: a static scene for dedup,
/// broken (zero-byte) frames, and an online switch that simulates device
/// loss and recovery.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
    /// When true, every frame carries identical pixels
    static_scene: bool,
    /// Emit a zero-byte frame every N grabs (0 = never)
    broken_every: u64,
    online: Arc<AtomicBool>,
    sequence: u64,
    next_frame_at: Option<Instant>,
    buffer: Vec<u8>,
    closed: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, format: PixelFormat, fps: u32) -> Self {
        Self {
            width,
            height,
            format,
            fps,
            static_scene: false,
            broken_every: 0,
            online: Arc::new(AtomicBool::new(true)),
            sequence: 0,
            next_frame_at: None,
            buffer: Vec::new(),
            closed: false,
        }
    }

    /// Produce identical pixels on every grab
    pub fn static_scene(mut self) -> Self {
        self.static_scene = true;
        self
    }

    /// Emit a zero-byte frame every `n` grabs
    pub fn broken_every(mut self, n: u64) -> Self {
        self.broken_every = n;
        self
    }

    /// Switch shared with tests: set false to simulate device loss
    pub fn online_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    fn fill_pattern(&mut self) {
        let bpp = self.format.bytes_per_pixel().unwrap_or(2) as usize;
        let len = self.width as usize * self.height as usize * bpp;
        self.buffer.resize(len, 0);

        // Horizontal gradient, shifted per frame unless the scene is static
        let shift = if self.static_scene {
            0
        } else {
            (self.sequence % 251) as usize
        };
        for (i, byte) in self.buffer.iter_mut().enumerate() {
            *byte = ((i / bpp + shift) % 256) as u8;
        }
    }
}

impl CaptureSource for TestPatternSource {
    fn negotiate(&mut self, config: &CaptureConfig) -> Result<AppliedFormat, SourceError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(SourceError::Gone("test source offline".into()));
        }
        self.closed = false;
        self.next_frame_at = None;

        // The pattern generator accepts any packed raw geometry as-is
        Ok(AppliedFormat {
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.width * self.format.bytes_per_pixel().unwrap_or(2),
            fps: if config.desired_fps > 0 && config.desired_fps < self.fps {
                config.desired_fps
            } else {
                self.fps
            },
        })
    }

    fn grab(&mut self, timeout: Duration) -> Result<SourceFrame<'_>, SourceError> {
        if self.closed {
            return Err(SourceError::Gone("test source closed".into()));
        }
        if !self.online.load(Ordering::Acquire) {
            return Err(SourceError::Gone("test source offline".into()));
        }

        // Pace to the configured frame rate
        let interval = Duration::from_secs_f64(1.0 / self.fps.max(1) as f64);
        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(SourceError::Timeout);
            }
            std::thread::sleep(wait);
        }
        self.next_frame_at = Some(due.max(now) + interval);

        self.sequence += 1;

        if self.broken_every > 0 && self.sequence % self.broken_every == 0 {
            self.buffer.clear();
        } else {
            self.fill_pattern();
        }

        Ok(SourceFrame {
            data: &self.buffer,
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.width * self.format.bytes_per_pixel().unwrap_or(2),
            grab_ts: monotonic_now(),
            sequence: self.sequence,
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.buffer = Vec::new();
    }
}
