//! JPEG encoding
//!
//! The `Encoder` trait plus the worker pool that drives it. Workers own
//! their encoder instances exclusively; nothing here is shared across
//! threads except the ring and the output channel.

pub mod encoder;
pub mod pool;

pub use encoder::{CpuEncoder, Encoder, EncoderKind, HwEncoder, DEFAULT_QUALITY};
pub use pool::{WorkerEvent, WorkerPool, FATAL_ENCODER_LIMIT};
