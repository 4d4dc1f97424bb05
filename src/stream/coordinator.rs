//! Stream coordinator
//!
//! Single task that turns unordered worker output into the published
//! sequence: grab-order admission, drop-same dedup, liveness overlay and
//! the offline placeholder cadence. Everything downstream (HTTP sessions,
//! sinks) sees only what this task publishes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::capture::frame::monotonic_now;
use crate::encode::pool::WorkerEvent;
use crate::error::Error;
use crate::stats::PipelineStats;
use crate::stream::broadcast::Broadcaster;
use crate::stream::dedup::DropSame;
use crate::stream::frame::EncodedFrame;
use crate::stream::offline::OfflinePlaceholder;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Dedup window, 0..=30; 0 disables drop-same
    pub drop_same_frames: u32,

    /// How long after the last live frame the stream still counts as online
    pub online_window: Duration,

    /// Cadence of offline placeholder publishes
    pub offline_refresh: Duration,

    /// Quality used for placeholder rendering
    pub quality: u8,

    /// Geometry for placeholders before any frame was ever published
    pub fallback_width: u32,
    pub fallback_height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            drop_same_frames: 0,
            online_window: Duration::from_secs(1),
            offline_refresh: Duration::from_secs(1),
            quality: crate::encode::encoder::DEFAULT_QUALITY,
            fallback_width: 640,
            fallback_height: 480,
        }
    }
}

/// Runs until the worker channel disconnects (pipeline shutdown)
pub struct Coordinator {
    config: StreamConfig,
    rx: flume::Receiver<WorkerEvent>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    fatal_tx: flume::Sender<Error>,

    next_seq: u64,
    last_grab_ts: f64,
    last_geometry: (u32, u32),
    dedup: DropSame,
    placeholder: OfflinePlaceholder,
}

impl Coordinator {
    pub fn new(
        config: StreamConfig,
        rx: flume::Receiver<WorkerEvent>,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<PipelineStats>,
        fatal_tx: flume::Sender<Error>,
    ) -> Self {
        let dedup = DropSame::new(config.drop_same_frames);
        let placeholder = OfflinePlaceholder::new(config.quality);
        let last_geometry = (config.fallback_width, config.fallback_height);
        Self {
            config,
            rx,
            broadcaster,
            stats,
            fatal_tx,
            next_seq: 0,
            last_grab_ts: f64::NEG_INFINITY,
            last_geometry,
            dedup,
            placeholder,
        }
    }

    pub async fn run(mut self) {
        // Deadline after which the stream is considered offline
        let mut online_until = Instant::now() + self.config.online_window;
        let mut offline_tick = tokio::time::interval(self.config.offline_refresh);
        offline_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv_async() => match event {
                    Ok(WorkerEvent::Encoded(frame)) => {
                        // Any encoded arrival proves the source is alive,
                        // even if ordering or dedup ends up dropping it
                        online_until = Instant::now() + self.config.online_window;
                        self.admit(frame);
                    }
                    Ok(WorkerEvent::Fatal { worker_id, reason }) => {
                        tracing::error!(worker_id, %reason, "worker pool fatal");
                        let _ = self
                            .fatal_tx
                            .send(Error::EncoderFatal(reason));
                    }
                    Err(_) => break,
                },
                _ = offline_tick.tick() => {
                    if Instant::now() >= online_until {
                        self.publish_offline();
                    }
                }
            }
        }

        // Final placeholder lets connected viewers render "offline" before
        // the EOF lands
        self.publish_offline();
        self.broadcaster.close();
        tracing::debug!("coordinator exiting");
    }

    /// Apply ordering and dedup; publish if the frame survives
    fn admit(&mut self, mut frame: EncodedFrame) {
        // Viewers must see capture time advance monotonically; a late
        // worker result is worthless because a newer frame is already out
        if frame.grab_ts < self.last_grab_ts {
            self.stats.dropped_out_of_order.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                grab_ts = frame.grab_ts,
                last = self.last_grab_ts,
                "dropping out-of-order frame"
            );
            return;
        }

        if !self.dedup.admit(frame.hash) {
            self.stats.deduped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        frame.online = true;
        self.last_geometry = (frame.width, frame.height);
        self.publish(frame);
    }

    fn publish_offline(&mut self) {
        let (width, height) = self.last_geometry;
        let jpeg = self.placeholder.get(width, height);
        let frame = EncodedFrame::synthetic(jpeg, width, height, monotonic_now(), false);
        self.publish(frame);
    }

    fn publish(&mut self, mut frame: EncodedFrame) {
        self.next_seq += 1;
        frame.published_seq = self.next_seq;
        self.last_grab_ts = frame.grab_ts;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats.queued_fps.tick(frame.grab_ts);
        self.broadcaster.publish(Arc::new(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn spawn_coordinator(
        config: StreamConfig,
    ) -> (
        flume::Sender<WorkerEvent>,
        Arc<Broadcaster>,
        Arc<PipelineStats>,
        flume::Receiver<Error>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = flume::bounded(32);
        let broadcaster = Arc::new(Broadcaster::new());
        let stats = Arc::new(PipelineStats::default());
        let (fatal_tx, fatal_rx) = flume::bounded(1);
        let coordinator = Coordinator::new(
            config,
            rx,
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
            fatal_tx,
        );
        let handle = tokio::spawn(coordinator.run());
        (tx, broadcaster, stats, fatal_rx, handle)
    }

    fn encoded(grab_ts: f64, payload: &[u8]) -> WorkerEvent {
        WorkerEvent::Encoded(EncodedFrame::synthetic(
            Bytes::copy_from_slice(payload),
            64,
            48,
            grab_ts,
            true,
        ))
    }

    #[tokio::test]
    async fn test_publishes_dense_sequence_in_grab_order() {
        let (tx, broadcaster, stats, _fatal, handle) =
            spawn_coordinator(StreamConfig::default());
        let mut sub = broadcaster.subscribe();

        tx.send(encoded(1.0, b"a")).unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.published_seq, 1);
        assert!(first.online);

        tx.send(encoded(2.0, b"b")).unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.published_seq, 2);
        assert!(second.grab_ts >= first.grab_ts);

        assert_eq!(stats.published.load(Ordering::Relaxed), 2);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_result_dropped() {
        let (tx, broadcaster, stats, _fatal, handle) =
            spawn_coordinator(StreamConfig::default());
        let mut sub = broadcaster.subscribe();

        tx.send(encoded(5.0, b"new")).unwrap();
        assert_eq!(sub.next().await.unwrap().published_seq, 1);

        // A slower worker finishing an older grab must not regress time
        tx.send(encoded(4.0, b"stale")).unwrap();
        tx.send(encoded(6.0, b"newer")).unwrap();
        let frame = sub.next().await.unwrap();
        assert_eq!(frame.published_seq, 2);
        assert_eq!(frame.grab_ts, 6.0);
        assert_eq!(stats.dropped_out_of_order.load(Ordering::Relaxed), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_suppresses_then_forces_keepalive() {
        let config = StreamConfig {
            drop_same_frames: 3,
            ..StreamConfig::default()
        };
        let (tx, broadcaster, stats, _fatal, handle) = spawn_coordinator(config);
        let mut sub = broadcaster.subscribe();

        tx.send(encoded(1.0, b"same")).unwrap();
        assert_eq!(sub.next().await.unwrap().published_seq, 1);

        // Identical payload: dropped until the repeat window runs out
        for ts in [2.0, 3.0, 4.0] {
            tx.send(encoded(ts, b"same")).unwrap();
        }
        // The 4th identical frame is force-published as keepalive
        tx.send(encoded(5.0, b"same")).unwrap();
        let keepalive = sub.next().await.unwrap();
        assert_eq!(keepalive.published_seq, 2);
        assert_eq!(keepalive.grab_ts, 5.0);
        assert_eq!(stats.deduped.load(Ordering::Relaxed), 3);

        // A changed frame publishes immediately
        tx.send(encoded(6.0, b"changed")).unwrap();
        assert_eq!(sub.next().await.unwrap().published_seq, 3);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_placeholder_cadence_and_recovery() {
        let config = StreamConfig {
            online_window: Duration::from_millis(200),
            offline_refresh: Duration::from_millis(100),
            ..StreamConfig::default()
        };
        let (tx, broadcaster, _stats, _fatal, handle) = spawn_coordinator(config);
        let mut sub = broadcaster.subscribe();

        tx.send(encoded(monotonic_now(), b"live")).unwrap();
        let live = sub.next().await.unwrap();
        assert!(live.online);
        assert_eq!((live.width, live.height), (64, 48));

        // No more live frames: placeholders start after the online window
        let placeholder = sub.next().await.unwrap();
        assert!(!placeholder.online);
        assert_eq!((placeholder.width, placeholder.height), (64, 48));
        assert_eq!(&placeholder.data[..2], &[0xFF, 0xD8]);

        let again = sub.next().await.unwrap();
        assert!(!again.online);
        assert!(again.published_seq > placeholder.published_seq);

        // Live frames resume and win immediately; at most one placeholder
        // raced in before the coordinator saw the new frame
        tx.send(encoded(monotonic_now() + 1000.0, b"back")).unwrap();
        let mut resumed = sub.next().await.unwrap();
        let mut strays = 0;
        while !resumed.online {
            strays += 1;
            assert!(strays < 3, "live frame expected after recovery");
            resumed = sub.next().await.unwrap();
        }
        assert!(resumed.online);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_fatal_forwarded() {
        let (tx, _broadcaster, _stats, fatal, handle) =
            spawn_coordinator(StreamConfig::default());

        tx.send(WorkerEvent::Fatal {
            worker_id: 1,
            reason: "cpu fallback failed".into(),
        })
        .unwrap();

        let error = fatal.recv_async().await.unwrap();
        assert!(matches!(error, Error::EncoderFatal(_)));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_final_placeholder_then_eof() {
        let (tx, broadcaster, _stats, _fatal, handle) =
            spawn_coordinator(StreamConfig::default());
        let mut sub = broadcaster.subscribe();

        tx.send(encoded(1.0, b"live")).unwrap();
        assert!(sub.next().await.unwrap().online);

        drop(tx);
        let last = sub.next().await.unwrap();
        assert!(!last.online);
        assert!(sub.next().await.is_none());
        handle.await.unwrap();
    }
}
