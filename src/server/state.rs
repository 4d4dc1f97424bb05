//! `/state` endpoint snapshot
//!
//! Serialized once per request; everything here reads atomics or short
//! locks, so building a snapshot never blocks the pipeline.

use serde::Serialize;

use crate::capture::LivenessState;
use crate::stats::ClientSnapshot;

use super::context::ServerContext;

/// Top-level `/state` document
#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    pub encoder: EncoderState,
    pub source: SourceState,
    pub stream: StreamState,
}

#[derive(Debug, Serialize)]
pub struct EncoderState {
    #[serde(rename = "type")]
    pub kind: String,
    pub quality: u8,
}

#[derive(Debug, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
pub struct SourceState {
    pub resolution: Resolution,
    pub format: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub desired_fps: u32,
    pub captured_fps: u64,
}

#[derive(Debug, Serialize)]
pub struct StreamState {
    pub queued_fps: u64,
    pub clients: usize,
    pub clients_stat: Vec<ClientSnapshot>,
}

impl StateSnapshot {
    /// Collect the current state from the running pipeline
    pub fn collect(ctx: &ServerContext) -> Self {
        let applied = ctx.capture.applied_format();
        let (mut width, mut height) = applied
            .map(|a| (a.width, a.height))
            .unwrap_or((0, 0));
        if let Some((fake_w, fake_h)) = ctx.fake_resolution {
            width = fake_w;
            height = fake_h;
        }

        Self {
            instance_id: ctx.instance_id.clone(),
            cmdline: ctx.cmdline.clone(),
            encoder: EncoderState {
                kind: ctx.encoder_kind.as_str().to_string(),
                quality: ctx.quality,
            },
            source: SourceState {
                resolution: Resolution { width, height },
                format: applied
                    .map(|a| a.format.as_str().to_string())
                    .unwrap_or_default(),
                online: ctx.capture.liveness() == LivenessState::Online,
                device: ctx.device_path.clone(),
                desired_fps: ctx.desired_fps,
                captured_fps: ctx.stats.captured_fps.fps(),
            },
            stream: StreamState {
                queued_fps: ctx.stats.queued_fps.fps(),
                clients: ctx.clients.count(),
                clients_stat: ctx.clients.snapshot(),
            },
        }
    }
}
