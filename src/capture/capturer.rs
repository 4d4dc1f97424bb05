//! Capture pump
//!
//! A dedicated thread owns the `CaptureSource` for its whole life
//! (negotiate, grab, close all happen on this thread) and pushes raw frames
//! into the ring. The state machine handles device loss, geometry changes
//! and broken-frame streaks; liveness is published through a watch channel
//! the coordinator and `/state` observe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::capture::config::CaptureConfig;
use crate::capture::source::{AppliedFormat, CaptureSource};
use crate::error::{Error, SourceError};
use crate::ring::RawRing;
use crate::stats::PipelineStats;

/// Capturer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    /// Negotiating format, waiting for the first frame
    Probing,
    Streaming,
    /// Device lost, waiting out the retry backoff
    SourceLost,
    /// Geometry changed, re-probing with new geometry
    Resizing,
}

/// What subscribers should believe about the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Online,
    Offline,
    Reconnecting,
}

/// Poll interval while streaming; also bounds close() latency
const GRAB_TIMEOUT: Duration = Duration::from_millis(500);

/// Backoff bounds for re-probing a lost source
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

struct CaptureShared {
    state: Mutex<CaptureState>,
    applied: Mutex<Option<AppliedFormat>>,
    stop: AtomicBool,
}

/// Cloneable read-only view of the capturer for `/state`
#[derive(Clone)]
pub struct CaptureView {
    shared: Arc<CaptureShared>,
    liveness_rx: watch::Receiver<LivenessState>,
}

impl CaptureView {
    pub fn state(&self) -> CaptureState {
        *self.shared.state.lock()
    }

    pub fn liveness(&self) -> LivenessState {
        *self.liveness_rx.borrow()
    }

    pub fn applied_format(&self) -> Option<AppliedFormat> {
        *self.shared.applied.lock()
    }
}

/// Handle owned by the supervisor
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
    ring: Arc<RawRing>,
    liveness_rx: watch::Receiver<LivenessState>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Spawn the capture thread
    pub fn start(
        source: Box<dyn CaptureSource>,
        config: CaptureConfig,
        ring: Arc<RawRing>,
        stats: Arc<PipelineStats>,
        fatal_tx: flume::Sender<Error>,
    ) -> Self {
        let shared = Arc::new(CaptureShared {
            state: Mutex::new(CaptureState::Probing),
            applied: Mutex::new(None),
            stop: AtomicBool::new(false),
        });
        let (liveness_tx, liveness_rx) = watch::channel(LivenessState::Reconnecting);

        let thread = {
            let shared = Arc::clone(&shared);
            let ring = Arc::clone(&ring);
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    Pump {
                        source,
                        config,
                        shared,
                        ring,
                        stats,
                        liveness_tx,
                        fatal_tx,
                    }
                    .run()
                })
                .expect("spawn capture thread")
        };

        Self {
            shared,
            ring,
            liveness_rx,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.shared.state.lock()
    }

    pub fn liveness(&self) -> LivenessState {
        *self.liveness_rx.borrow()
    }

    /// Watch receiver for liveness transitions
    pub fn liveness_watch(&self) -> watch::Receiver<LivenessState> {
        self.liveness_rx.clone()
    }

    /// Cloneable view handed to the HTTP server
    pub fn view(&self) -> CaptureView {
        CaptureView {
            shared: Arc::clone(&self.shared),
            liveness_rx: self.liveness_rx.clone(),
        }
    }

    /// Format the source actually applied, once probing succeeded
    pub fn applied_format(&self) -> Option<AppliedFormat> {
        *self.shared.applied.lock()
    }

    /// Stop the pump and release the device
    ///
    /// Idempotent. Closes the ring (draining unclaimed slots), joins the
    /// capture thread, then waits until every in-flight slot is released so
    /// no worker still borrows capture memory.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.ring.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.ring.wait_all_released();
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pump {
    source: Box<dyn CaptureSource>,
    config: CaptureConfig,
    shared: Arc<CaptureShared>,
    ring: Arc<RawRing>,
    stats: Arc<PipelineStats>,
    liveness_tx: watch::Sender<LivenessState>,
    fatal_tx: flume::Sender<Error>,
}

impl Pump {
    fn run(mut self) {
        let mut backoff = RETRY_BACKOFF_INITIAL;
        let mut broken_streak = 0u32;

        while !self.stopped() {
            let state = *self.shared.state.lock();
            match state {
                CaptureState::Probing => {
                    self.set_liveness(LivenessState::Reconnecting);
                    match self.probe() {
                        Ok(()) => {
                            backoff = RETRY_BACKOFF_INITIAL;
                            broken_streak = 0;
                            self.set_state(CaptureState::Streaming);
                            self.set_liveness(LivenessState::Online);
                        }
                        Err(SourceError::Gone(reason)) if !self.config.persistent => {
                            self.fail(Error::SourceGone(reason));
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, backoff = ?backoff, "probe failed, retrying");
                            self.sleep_interruptible(backoff);
                            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                        }
                    }
                }
                CaptureState::Streaming => match self.pump_one(&mut broken_streak) {
                    Ok(()) => {}
                    Err(SourceError::Timeout) => {}
                    Err(SourceError::Resized) => {
                        tracing::info!("source geometry changed, re-probing");
                        self.set_state(CaptureState::Resizing);
                    }
                    Err(SourceError::Broken) => {
                        // Streak bookkeeping happens in pump_one
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "source lost");
                        self.set_state(CaptureState::SourceLost);
                    }
                },
                CaptureState::SourceLost => {
                    self.set_liveness(LivenessState::Reconnecting);
                    if !self.config.persistent {
                        self.fail(Error::SourceGone("capture source lost".into()));
                        break;
                    }
                    self.sleep_interruptible(backoff);
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    self.set_state(CaptureState::Probing);
                }
                CaptureState::Resizing => {
                    // Immediate re-probe with whatever the source reports now
                    self.set_state(CaptureState::Probing);
                }
                CaptureState::Closed => break,
            }
        }

        self.source.close();
        self.set_state(CaptureState::Closed);
        self.set_liveness(LivenessState::Offline);
        tracing::debug!("capture thread exiting");
    }

    /// Negotiate the format and wait for the first frame within the open
    /// timeout.
    fn probe(&mut self) -> Result<(), SourceError> {
        let applied = self.source.negotiate(&self.config)?;
        tracing::info!(
            width = applied.width,
            height = applied.height,
            format = %applied.format,
            fps = applied.fps,
            "source format applied"
        );
        *self.shared.applied.lock() = Some(applied);

        let frame = self.source.grab(self.config.open_timeout)?;
        if frame.data.is_empty() {
            return Err(SourceError::Broken);
        }
        // Disjoint field borrows: `frame` borrows the source, the ring
        // write only touches `self.ring`/`self.stats`
        if let Some(mut writer) = self.ring.acquire_empty() {
            writer.frame_mut().assign(
                frame.data,
                frame.width,
                frame.height,
                frame.format,
                frame.stride,
                frame.grab_ts,
            );
            writer.publish();
            self.stats.grabbed.fetch_add(1, Ordering::Relaxed);
            self.stats.captured_fps.tick(frame.grab_ts);
        }
        Ok(())
    }

    /// Grab one frame and push it into the ring
    fn pump_one(&mut self, broken_streak: &mut u32) -> Result<(), SourceError> {
        let applied = self.shared.applied.lock().unwrap_or(AppliedFormat {
            width: 0,
            height: 0,
            format: crate::capture::frame::PixelFormat::Yuyv,
            stride: 0,
            fps: 0,
        });

        let frame = self.source.grab(GRAB_TIMEOUT)?;

        if frame.data.is_empty() {
            *broken_streak += 1;
            self.stats.broken.fetch_add(1, Ordering::Relaxed);
            if *broken_streak > self.config.broken_limit {
                tracing::warn!(streak = *broken_streak, "broken frame limit hit");
                *broken_streak = 0;
                self.set_state(CaptureState::SourceLost);
            }
            return Err(SourceError::Broken);
        }
        *broken_streak = 0;

        if frame.width != applied.width || frame.height != applied.height {
            return Err(SourceError::Resized);
        }

        // Blocks only when every slot is in flight; close() unblocks it
        if let Some(mut writer) = self.ring.acquire_empty() {
            writer.frame_mut().assign(
                frame.data,
                frame.width,
                frame.height,
                frame.format,
                frame.stride,
                frame.grab_ts,
            );
            writer.publish();
            self.stats.grabbed.fetch_add(1, Ordering::Relaxed);
            self.stats.captured_fps.tick(frame.grab_ts);
        }
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn sleep_interruptible(&self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut slept = Duration::ZERO;
        while slept < total && !self.stopped() {
            std::thread::sleep(step.min(total - slept));
            slept += step;
        }
    }

    fn set_state(&self, state: CaptureState) {
        *self.shared.state.lock() = state;
    }

    fn set_liveness(&self, liveness: LivenessState) {
        // send only fails with no receivers, which is fine during teardown
        let _ = self.liveness_tx.send(liveness);
    }

    fn fail(&self, error: Error) {
        tracing::error!(error = %error, "capture fatal");
        let _ = self.fatal_tx.send(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::source::TestPatternSource;
    use crate::ring::ReleaseOutcome;

    fn start_pattern(
        source: TestPatternSource,
        config: CaptureConfig,
    ) -> (CaptureHandle, Arc<RawRing>, flume::Receiver<Error>) {
        let ring = Arc::new(RawRing::new(config.buffers as usize));
        let stats = Arc::new(PipelineStats::default());
        let (fatal_tx, fatal_rx) = flume::bounded(1);
        let handle = CaptureHandle::start(
            Box::new(source),
            config,
            Arc::clone(&ring),
            stats,
            fatal_tx,
        );
        (handle, ring, fatal_rx)
    }

    #[test]
    fn test_streams_frames_into_ring() {
        let source = TestPatternSource::new(16, 16, PixelFormat::Grey, 120);
        let (mut handle, ring, _fatal) = start_pattern(source, CaptureConfig::default());

        let mut last_ts = 0.0;
        for _ in 0..3 {
            let reader = ring.claim_filled(0).unwrap();
            assert!(reader.frame().grab_ts >= last_ts);
            assert_eq!(reader.frame().width, 16);
            last_ts = reader.frame().grab_ts;
            reader.release(ReleaseOutcome::Encoded);
        }
        assert_eq!(handle.state(), CaptureState::Streaming);
        assert_eq!(handle.liveness(), LivenessState::Online);

        handle.close();
        assert_eq!(handle.state(), CaptureState::Closed);
        assert_eq!(handle.liveness(), LivenessState::Offline);
    }

    #[test]
    fn test_applied_format_reported() {
        let source = TestPatternSource::new(320, 240, PixelFormat::Yuyv, 60);
        let (mut handle, ring, _fatal) = start_pattern(source, CaptureConfig::default());

        let reader = ring.claim_filled(0).unwrap();
        reader.release(ReleaseOutcome::Encoded);

        let applied = handle.applied_format().unwrap();
        assert_eq!((applied.width, applied.height), (320, 240));
        assert_eq!(applied.format, PixelFormat::Yuyv);
        handle.close();
    }

    #[test]
    fn test_source_loss_without_persistent_is_fatal() {
        let source = TestPatternSource::new(16, 16, PixelFormat::Grey, 240);
        let switch = source.online_switch();
        let (mut handle, ring, fatal) = start_pattern(source, CaptureConfig::default());

        let reader = ring.claim_filled(0).unwrap();
        reader.release(ReleaseOutcome::Encoded);

        switch.store(false, Ordering::Release);
        let error = fatal.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(error, Error::SourceGone(_)));
        handle.close();
    }

    #[test]
    fn test_persistent_source_recovers() {
        let source = TestPatternSource::new(16, 16, PixelFormat::Grey, 240);
        let switch = source.online_switch();
        let config = CaptureConfig::default().persistent(true);
        let (mut handle, ring, fatal) = start_pattern(source, config);

        let reader = ring.claim_filled(0).unwrap();
        reader.release(ReleaseOutcome::Encoded);

        switch.store(false, Ordering::Release);
        // Wait for the pump to notice and go into reconnect
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.liveness() != LivenessState::Reconnecting
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.liveness(), LivenessState::Reconnecting);
        assert!(fatal.is_empty());

        switch.store(true, Ordering::Release);
        // Backoff is at most a few seconds; frames must flow again
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut recovered = false;
        while std::time::Instant::now() < deadline {
            if let Some(reader) = ring.claim_filled(0) {
                recovered = true;
                reader.release(ReleaseOutcome::Encoded);
                break;
            }
        }
        assert!(recovered);
        handle.close();
    }
}
