//! Frame capture
//!
//! The capturer owns an abstract `CaptureSource` on a dedicated thread and
//! feeds the raw ring. Platform camera drivers live outside this crate and
//! plug in through the `CaptureSource` trait.

pub mod capturer;
pub mod config;
pub mod frame;
pub mod source;

pub use capturer::{CaptureHandle, CaptureState, CaptureView, LivenessState};
pub use config::{CaptureConfig, DvTimings};
pub use frame::{monotonic_now, Frame, PixelFormat};
pub use source::{AppliedFormat, CaptureSource, SourceFrame, TestPatternSource};
