//! Pipeline assembly
//!
//! Wires source -> ring -> workers -> coordinator -> broadcaster and owns
//! the shutdown order. Supervision is strictly top-down: the pipeline hands
//! workers a ring handle and a send-only port to the coordinator, and
//! nothing downstream ever calls back up.

use std::sync::Arc;

use crate::capture::{CaptureConfig, CaptureHandle, CaptureSource, CaptureView};
use crate::encode::{EncoderKind, WorkerPool};
use crate::error::Error;
use crate::ring::RawRing;
use crate::stats::PipelineStats;
use crate::stream::{Broadcaster, Coordinator, StreamConfig};

/// Everything needed to start the capture-to-broadcast pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub encoder: EncoderKind,
    pub quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            stream: StreamConfig::default(),
            encoder: EncoderKind::Cpu,
            quality: crate::encode::DEFAULT_QUALITY,
        }
    }
}

/// Running pipeline; dropping it without `shutdown` still releases the
/// device through the capture handle's guard
pub struct Pipeline {
    capture: CaptureHandle,
    pool: Option<WorkerPool>,
    coordinator: Option<tokio::task::JoinHandle<()>>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    fatal_rx: flume::Receiver<Error>,
}

impl Pipeline {
    /// Start capture, workers and coordinator
    ///
    /// Must run inside a tokio runtime (the coordinator is spawned on it).
    pub fn start(source: Box<dyn CaptureSource>, config: PipelineConfig) -> Self {
        let ring = Arc::new(RawRing::new(config.capture.buffers as usize));
        let stats = Arc::new(PipelineStats::default());
        let broadcaster = Arc::new(Broadcaster::new());
        let (fatal_tx, fatal_rx) = flume::bounded(4);

        // Worker output flows to the coordinator over a bounded channel;
        // its depth matches the ring so backpressure stays in the ring
        let (worker_tx, worker_rx) = flume::bounded(config.capture.buffers as usize * 2);

        let workers = config.capture.effective_workers();
        let pool = WorkerPool::spawn(
            workers,
            config.encoder,
            config.quality,
            Arc::clone(&ring),
            worker_tx,
            Arc::clone(&stats),
        );

        let coordinator = Coordinator::new(
            config.stream,
            worker_rx,
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
            fatal_tx.clone(),
        );
        let coordinator = tokio::spawn(coordinator.run());

        let capture = CaptureHandle::start(
            source,
            config.capture,
            Arc::clone(&ring),
            Arc::clone(&stats),
            fatal_tx,
        );

        Self {
            capture,
            pool: Some(pool),
            coordinator: Some(coordinator),
            broadcaster,
            stats,
            fatal_rx,
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn capture_view(&self) -> CaptureView {
        self.capture.view()
    }

    /// Resolves when a fatal pipeline error occurs
    ///
    /// Pending forever on a healthy pipeline, so it slots into a `select!`
    /// next to the server future.
    pub async fn fatal(&self) -> Error {
        match self.fatal_rx.recv_async().await {
            Ok(error) => error,
            // All senders gone means orderly shutdown; stay pending so the
            // select picks another branch
            Err(_) => std::future::pending().await,
        }
    }

    /// Orderly shutdown: capture stops and drains, workers finish in-flight
    /// encodes, the coordinator flushes its final frame and signals EOF to
    /// every session
    pub async fn shutdown(mut self) {
        let mut capture = self.capture;
        let pool = self.pool.take();

        // close() joins the capture thread and blocks on slot release;
        // keep that off the async workers
        let join_result = tokio::task::spawn_blocking(move || {
            capture.close();
            if let Some(pool) = pool {
                pool.join();
            }
        })
        .await;
        if let Err(e) = join_result {
            tracing::error!(error = %e, "pipeline teardown task failed");
        }

        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.await;
        }
        tracing::info!("pipeline stopped");
    }
}
