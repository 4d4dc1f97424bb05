//! Shared server context
//!
//! One `Arc<ServerContext>` is handed to every connection task. Everything
//! in here is either immutable after startup or internally synchronized.

use std::sync::Arc;

use crate::capture::CaptureView;
use crate::encode::EncoderKind;
use crate::stats::{ClientRegistry, PipelineStats};
use crate::stream::Broadcaster;

/// Read-only view of the pipeline for request handling
pub struct ServerContext {
    pub broadcaster: Arc<Broadcaster>,
    pub stats: Arc<PipelineStats>,
    pub clients: ClientRegistry,
    pub capture: CaptureView,

    pub encoder_kind: EncoderKind,
    pub quality: u8,
    pub desired_fps: u32,

    /// Identifier echoed in `/state`
    pub instance_id: String,

    /// Process command line, present only with `expose_cmdline`
    pub cmdline: Option<String>,

    /// Device path, present only with `expose_path`
    pub device_path: Option<String>,

    /// Resolution override for `/state`
    pub fake_resolution: Option<(u32, u32)>,

    /// Geometry echoed on `/stream` before the source has negotiated one
    pub fallback_resolution: (u32, u32),
}
