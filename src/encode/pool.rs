//! Encode worker pool
//!
//! N workers, each on its own thread with exclusive ownership of one
//! encoder instance. Workers claim filled ring slots, compress, and hand
//! the result to the coordinator over a bounded channel. A worker whose
//! encoder keeps failing downgrades itself to CPU; if the CPU encoder also
//! fails repeatedly the pool halts and the failure surfaces to the
//! supervisor.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::capture::frame::monotonic_now;
use crate::encode::encoder::{CpuEncoder, Encoder, EncoderKind};
use crate::ring::{RawRing, ReleaseOutcome};
use crate::stats::PipelineStats;
use crate::stream::frame::EncodedFrame;

/// Consecutive encode failures before a worker downgrades or halts
pub const FATAL_ENCODER_LIMIT: u32 = 3;

/// Messages workers send to the coordinator
#[derive(Debug)]
pub enum WorkerEvent {
    /// A frame was compressed successfully
    Encoded(EncodedFrame),
    /// A worker exhausted the CPU fallback; the pool is halting
    Fatal { worker_id: u32, reason: String },
}

/// Handle to the spawned workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers of the given encoder kind
    pub fn spawn(
        count: u32,
        kind: EncoderKind,
        quality: u8,
        ring: Arc<RawRing>,
        tx: flume::Sender<WorkerEvent>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let handles = (0..count)
            .map(|worker_id| {
                let ring = Arc::clone(&ring);
                let tx = tx.clone();
                let stats = Arc::clone(&stats);
                let encoder = kind.build(quality);
                std::thread::Builder::new()
                    .name(format!("encode-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, encoder, quality, ring, tx, stats))
                    .expect("spawn encode worker")
            })
            .collect();

        tracing::info!(workers = count, encoder = %kind, quality, "worker pool started");
        Self { handles }
    }

    /// Wait for every worker to exit
    ///
    /// Callers close the ring first; workers drain and return on their own.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: u32,
    mut encoder: Box<dyn Encoder>,
    quality: u8,
    ring: Arc<RawRing>,
    tx: flume::Sender<WorkerEvent>,
    stats: Arc<PipelineStats>,
) {
    let mut out = Vec::new();
    let mut consecutive_failures = 0u32;
    let mut downgraded = false;

    while let Some(mut reader) = ring.claim_filled(worker_id) {
        reader.begin_encode();
        let encode_begin_ts = monotonic_now();
        let result = encoder.encode(reader.frame(), &mut out);
        let encode_end_ts = monotonic_now();

        match result {
            Ok(()) => {
                consecutive_failures = 0;
                let frame = EncodedFrame::from_encode(
                    &out,
                    reader.frame(),
                    reader.slot_index(),
                    reader.generation(),
                    encode_begin_ts,
                    encode_end_ts,
                );
                reader.release(ReleaseOutcome::Encoded);
                if tx.send(WorkerEvent::Encoded(frame)).is_err() {
                    // Coordinator gone, shutdown in progress
                    break;
                }
            }
            Err(e) => {
                stats.encode_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(worker_id, error = %e, "frame encode failed, dropping");
                reader.release(ReleaseOutcome::Dropped);

                consecutive_failures += 1;
                if consecutive_failures >= FATAL_ENCODER_LIMIT {
                    if downgraded || encoder.kind() == EncoderKind::Cpu {
                        let reason = format!("encoder failed {consecutive_failures} times: {e}");
                        tracing::error!(worker_id, %reason, "worker halting");
                        let _ = tx.send(WorkerEvent::Fatal { worker_id, reason });
                        return;
                    }
                    tracing::warn!(
                        worker_id,
                        from = %encoder.kind(),
                        "downgrading worker to cpu encoder"
                    );
                    encoder = Box::new(CpuEncoder::new(quality));
                    downgraded = true;
                    consecutive_failures = 0;
                }
            }
        }
    }

    tracing::debug!(worker_id, "worker exiting");
}
