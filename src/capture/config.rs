//! Capture configuration

use crate::capture::frame::PixelFormat;
use crate::error::ConfigError;

/// Digital Video timing negotiation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvTimings {
    /// Do not touch DV timings
    None,
    /// Query the source for its current timings
    Query,
    /// Force a fixed geometry
    Fixed { width: u32, height: u32 },
}

/// Capture configuration options
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path or identifier handed to the source driver
    pub device_path: String,

    /// Requested geometry; the source may negotiate the nearest it supports
    pub desired_width: u32,
    pub desired_height: u32,

    /// Requested pixel format
    pub desired_format: PixelFormat,

    /// Requested frame rate (0 = driver default)
    pub desired_fps: u32,

    /// Input connector index (driver hint)
    pub input_index: u32,

    /// Video standard name (driver hint, empty = unset)
    pub standard: String,

    /// DV timings mode
    pub dv_timings: DvTimings,

    /// Keep retrying when the source disappears instead of exiting
    pub persistent: bool,

    /// Raw ring depth, must be >= 2
    pub buffers: u32,

    /// Upper bound on encode workers
    pub workers_hint: u32,

    /// How long `open()` may wait for the first frame
    pub open_timeout: std::time::Duration,

    /// Consecutive broken frames before the source is declared lost
    pub broken_limit: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".into(),
            desired_width: 640,
            desired_height: 480,
            desired_format: PixelFormat::Yuyv,
            desired_fps: 0,
            input_index: 0,
            standard: String::new(),
            dv_timings: DvTimings::None,
            persistent: false,
            buffers: 4,
            workers_hint: 1,
            open_timeout: std::time::Duration::from_secs(5),
            broken_limit: 50,
        }
    }
}

impl CaptureConfig {
    /// Create a config for the given device
    pub fn with_device(path: impl Into<String>) -> Self {
        Self {
            device_path: path.into(),
            ..Default::default()
        }
    }

    /// Set the requested geometry
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.desired_width = width;
        self.desired_height = height;
        self
    }

    /// Set the requested pixel format
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.desired_format = format;
        self
    }

    /// Set the requested frame rate
    pub fn fps(mut self, fps: u32) -> Self {
        self.desired_fps = fps;
        self
    }

    /// Set the ring depth
    pub fn buffers(mut self, buffers: u32) -> Self {
        self.buffers = buffers;
        self
    }

    /// Set the worker hint
    pub fn workers(mut self, workers: u32) -> Self {
        self.workers_hint = workers;
        self
    }

    /// Keep retrying on source loss
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffers < 2 {
            return Err(ConfigError::InvalidBuffers(self.buffers));
        }
        if self.workers_hint < 1 {
            return Err(ConfigError::InvalidWorkers(self.workers_hint));
        }
        if self.desired_width == 0 || self.desired_height == 0 {
            return Err(ConfigError::InvalidResolution(format!(
                "{}x{}",
                self.desired_width, self.desired_height
            )));
        }
        Ok(())
    }

    /// Number of encode workers to actually spawn
    ///
    /// Capped at `buffers - 1` so the producer always has a slot to fill.
    pub fn effective_workers(&self) -> u32 {
        self.workers_hint.min(self.buffers.saturating_sub(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(CaptureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chaining() {
        let config = CaptureConfig::with_device("/dev/video2")
            .resolution(1280, 720)
            .format(PixelFormat::Mjpeg)
            .fps(30)
            .buffers(6)
            .workers(3)
            .persistent(true);

        assert_eq!(config.device_path, "/dev/video2");
        assert_eq!(config.desired_width, 1280);
        assert_eq!(config.desired_height, 720);
        assert_eq!(config.desired_format, PixelFormat::Mjpeg);
        assert_eq!(config.desired_fps, 30);
        assert_eq!(config.buffers, 6);
        assert_eq!(config.workers_hint, 3);
        assert!(config.persistent);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let config = CaptureConfig::default().buffers(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBuffers(1))
        ));

        let config = CaptureConfig::default().workers(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkers(0))
        ));

        let config = CaptureConfig::default().resolution(0, 480);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_workers_leaves_producer_room() {
        let config = CaptureConfig::default().buffers(4).workers(8);
        assert_eq!(config.effective_workers(), 3);

        let config = CaptureConfig::default().buffers(2).workers(8);
        assert_eq!(config.effective_workers(), 1);

        let config = CaptureConfig::default().buffers(8).workers(2);
        assert_eq!(config.effective_workers(), 2);
    }
}
