//! Pipeline and client statistics
//!
//! Plain atomics shared via `Arc`; no global state. The per-second FPS
//! counters follow the capture clock so `/state` reports rates without a
//! background sampler task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Counter bumped once per event, read as events-per-second
///
/// Counts events within the current wall second; `fps()` reports the last
/// completed second.
#[derive(Debug, Default)]
pub struct FpsCounter {
    inner: Mutex<FpsInner>,
}

#[derive(Debug, Default)]
struct FpsInner {
    current_sec: u64,
    count: u64,
    last_fps: u64,
}

impl FpsCounter {
    /// Record one event at monotonic time `now` (seconds)
    pub fn tick(&self, now: f64) {
        let sec = now as u64;
        let mut inner = self.inner.lock();
        if sec != inner.current_sec {
            inner.last_fps = if sec == inner.current_sec + 1 {
                inner.count
            } else {
                0
            };
            inner.current_sec = sec;
            inner.count = 0;
        }
        inner.count += 1;
    }

    /// Events per second over the last completed second
    pub fn fps(&self) -> u64 {
        self.inner.lock().last_fps
    }
}

/// Counters for the capture/encode/publish pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Raw frames accepted from the source
    pub grabbed: AtomicU64,
    /// Zero-byte or otherwise unusable source frames
    pub broken: AtomicU64,
    /// Single-frame encode failures
    pub encode_errors: AtomicU64,
    /// Worker results discarded for arriving out of grab order
    pub dropped_out_of_order: AtomicU64,
    /// Frames suppressed by drop-same dedup
    pub deduped: AtomicU64,
    /// Frames admitted to the published sequence
    pub published: AtomicU64,

    /// Source frame rate, per second
    pub captured_fps: FpsCounter,
    /// Published frame rate, per second
    pub queued_fps: FpsCounter,
}

/// Live info about one connected stream client
#[derive(Debug)]
pub struct ClientEntry {
    pub peer_addr: SocketAddr,
    pub connected_at: Instant,
    pub delivered_frames: AtomicU64,
    pub delivered_bytes: AtomicU64,
}

/// Snapshot of one client for `/state`
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: u64,
    pub peer: String,
    pub fps: u64,
    pub frames: u64,
    pub bytes: u64,
}

/// Registry of connected stream clients
///
/// Lock held only for register/unregister and snapshotting, never during
/// socket I/O.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<u64, ClientEntry>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Add a client, returning its ID
    pub fn register(&self, peer_addr: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients.lock().insert(
            id,
            ClientEntry {
                peer_addr,
                connected_at: Instant::now(),
                delivered_frames: AtomicU64::new(0),
                delivered_bytes: AtomicU64::new(0),
            },
        );
        id
    }

    pub fn unregister(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    /// Record a delivered part for client `id`
    pub fn record_delivery(&self, id: u64, bytes: u64) {
        let clients = self.clients.lock();
        if let Some(entry) = clients.get(&id) {
            entry.delivered_frames.fetch_add(1, Ordering::Relaxed);
            entry.delivered_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let clients = self.clients.lock();
        let mut out: Vec<ClientSnapshot> = clients
            .iter()
            .map(|(&id, entry)| {
                let frames = entry.delivered_frames.load(Ordering::Relaxed);
                let secs = entry.connected_at.elapsed().as_secs();
                ClientSnapshot {
                    id,
                    peer: entry.peer_addr.to_string(),
                    fps: if secs > 0 { frames / secs } else { frames },
                    frames,
                    bytes: entry.delivered_bytes.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }
}
