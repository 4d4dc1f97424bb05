//! Bounded raw-frame ring
//!
//! Single producer (the capturer), multiple consumers (encode workers).
//! Each slot moves through `Empty -> Filled -> Claimed -> Encoding ->
//! Released -> Empty`; the generation counter increments on every refill so
//! downstream consumers can tie an encoded result back to the exact capture
//! it came from.
//!
//! Frames are moved out of a slot by value while a writer or reader holds
//! it and moved back on publish/release, so the buffer allocation is
//! recycled and the fast path never allocates. Blocking uses condvars, no
//! spinning: the producer parks only when every slot is in flight, workers
//! park when nothing is filled, and claims are FIFO-fair via a ticket queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::capture::frame::{Frame, PixelFormat};

/// Lifecycle of a single ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Filled,
    Claimed,
    Encoding,
    Released,
}

/// Result of an encode attempt, recorded on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The frame was encoded and handed to the coordinator
    Encoded,
    /// The frame was discarded (encode error, shutdown)
    Dropped,
}

struct Slot {
    frame: Option<Frame>,
    generation: u64,
    state: SlotState,
}

struct RingInner {
    slots: Vec<Slot>,
    /// Filled slot indices, oldest first
    filled: VecDeque<usize>,
    /// Empty slot indices
    empty: VecDeque<usize>,
    /// Worker IDs waiting on a filled slot, in arrival order
    claim_queue: VecDeque<u32>,
    closed: bool,
}

/// Counters observable from `/state`
#[derive(Debug, Default)]
pub struct RingCounters {
    pub produced: AtomicU64,
    pub encoded: AtomicU64,
    pub dropped: AtomicU64,
}

/// The raw frame ring
pub struct RawRing {
    inner: Mutex<RingInner>,
    producer_cv: Condvar,
    consumer_cv: Condvar,
    counters: RingCounters,
}

impl RawRing {
    /// Create a ring with `buffers` slots (>= 2)
    pub fn new(buffers: usize) -> Self {
        assert!(buffers >= 2, "ring needs at least 2 slots");

        let slots = (0..buffers)
            .map(|_| Slot {
                frame: Some(Frame::empty(PixelFormat::Yuyv)),
                generation: 0,
                state: SlotState::Empty,
            })
            .collect();

        Self {
            inner: Mutex::new(RingInner {
                slots,
                filled: VecDeque::with_capacity(buffers),
                empty: (0..buffers).collect(),
                claim_queue: VecDeque::with_capacity(buffers),
                closed: false,
            }),
            producer_cv: Condvar::new(),
            consumer_cv: Condvar::new(),
            counters: RingCounters::default(),
        }
    }

    pub fn counters(&self) -> &RingCounters {
        &self.counters
    }

    /// Producer side: take an empty slot, blocking while all slots are in
    /// flight. Returns `None` once the ring is closed.
    pub fn acquire_empty(&self) -> Option<SlotWriter<'_>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(index) = inner.empty.pop_front() {
                let slot = &mut inner.slots[index];
                debug_assert_eq!(slot.state, SlotState::Empty);
                let frame = slot.frame.take().expect("empty slot owns its frame");
                return Some(SlotWriter {
                    ring: self,
                    index,
                    frame: Some(frame),
                });
            }
            self.producer_cv.wait(&mut inner);
        }
    }

    /// Consumer side: claim the oldest filled slot, blocking until one is
    /// available. FIFO-fair across workers. Returns `None` once closed.
    pub fn claim_filled(&self, worker_id: u32) -> Option<SlotReader<'_>> {
        let mut inner = self.inner.lock();
        inner.claim_queue.push_back(worker_id);
        loop {
            if inner.closed {
                Self::leave_queue(&mut inner, worker_id);
                return None;
            }
            let at_front = inner.claim_queue.front() == Some(&worker_id);
            if at_front {
                if let Some(index) = inner.filled.pop_front() {
                    inner.claim_queue.pop_front();
                    // Hand the turn to the next waiter
                    self.consumer_cv.notify_all();

                    let slot = &mut inner.slots[index];
                    debug_assert_eq!(slot.state, SlotState::Filled);
                    slot.state = SlotState::Claimed;
                    let generation = slot.generation;
                    let frame = slot.frame.take().expect("filled slot owns its frame");
                    return Some(SlotReader {
                        ring: self,
                        index,
                        generation,
                        state: SlotState::Claimed,
                        frame: Some(frame),
                    });
                }
            }
            self.consumer_cv.wait(&mut inner);
        }
    }

    fn leave_queue(inner: &mut RingInner, worker_id: u32) {
        if let Some(pos) = inner.claim_queue.iter().position(|&id| id == worker_id) {
            inner.claim_queue.remove(pos);
        }
    }

    /// Close the ring and wake every parked thread
    ///
    /// Filled slots nobody claimed yet are drained back to Empty; workers
    /// only finish the frames they already hold.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        while let Some(index) = inner.filled.pop_front() {
            let slot = &mut inner.slots[index];
            slot.state = SlotState::Empty;
            inner.empty.push_back(index);
        }
        drop(inner);
        self.producer_cv.notify_all();
        self.consumer_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Block until every slot has returned to `Empty`
    ///
    /// Used on shutdown after `close()` so the capturer can guarantee no
    /// worker still borrows capture memory.
    pub fn wait_all_released(&self) {
        let mut inner = self.inner.lock();
        loop {
            let all_empty = inner.slots.iter().all(|s| s.state == SlotState::Empty);
            if all_empty {
                return;
            }
            self.producer_cv.wait(&mut inner);
        }
    }

    /// Number of slots currently filled and waiting for a worker
    pub fn filled_len(&self) -> usize {
        self.inner.lock().filled.len()
    }

    fn finish_publish(&self, index: usize, frame: Frame) -> u64 {
        let mut inner = self.inner.lock();
        let closed = inner.closed;
        let slot = &mut inner.slots[index];
        slot.frame = Some(frame);
        slot.generation += 1;
        let generation = slot.generation;

        if closed {
            // A publish racing with close() must not strand a Filled slot
            // nobody will ever claim
            slot.state = SlotState::Empty;
            inner.empty.push_back(index);
            drop(inner);
            self.producer_cv.notify_all();
        } else {
            slot.state = SlotState::Filled;
            inner.filled.push_back(index);
            drop(inner);
            self.counters.produced.fetch_add(1, Ordering::Relaxed);
            self.consumer_cv.notify_all();
        }
        generation
    }

    fn cancel_write(&self, index: usize, frame: Frame) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.frame = Some(frame);
        slot.state = SlotState::Empty;
        inner.empty.push_back(index);
        drop(inner);
        self.producer_cv.notify_all();
    }

    fn finish_release(&self, index: usize, frame: Frame, outcome: ReleaseOutcome) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.frame = Some(frame);
        slot.state = SlotState::Released;
        // Released is momentary; the slot immediately becomes refillable
        slot.state = SlotState::Empty;
        inner.empty.push_back(index);
        drop(inner);
        match outcome {
            ReleaseOutcome::Encoded => self.counters.encoded.fetch_add(1, Ordering::Relaxed),
            ReleaseOutcome::Dropped => self.counters.dropped.fetch_add(1, Ordering::Relaxed),
        };
        self.producer_cv.notify_all();
    }

    fn mark_encoding(&self, index: usize) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        debug_assert_eq!(slot.state, SlotState::Claimed);
        slot.state = SlotState::Encoding;
    }
}

/// Exclusive write access to one slot's frame
pub struct SlotWriter<'a> {
    ring: &'a RawRing,
    index: usize,
    frame: Option<Frame>,
}

impl SlotWriter<'_> {
    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().expect("writer owns its frame")
    }

    /// Transition the slot `Empty -> Filled`, waking one worker.
    /// Returns the slot's new generation.
    pub fn publish(mut self) -> u64 {
        let frame = self.frame.take().expect("writer owns its frame");
        self.ring.finish_publish(self.index, frame)
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        // Dropped without publish: the slot goes back to Empty untouched
        if let Some(frame) = self.frame.take() {
            self.ring.cancel_write(self.index, frame);
        }
    }
}

/// Exclusive read access to one claimed slot
pub struct SlotReader<'a> {
    ring: &'a RawRing,
    index: usize,
    generation: u64,
    state: SlotState,
    frame: Option<Frame>,
}

impl SlotReader<'_> {
    pub fn frame(&self) -> &Frame {
        self.frame.as_ref().expect("reader owns its frame")
    }

    pub fn slot_index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Transition `Claimed -> Encoding` before compression starts
    pub fn begin_encode(&mut self) {
        if self.state == SlotState::Claimed {
            self.state = SlotState::Encoding;
            self.ring.mark_encoding(self.index);
        }
    }

    /// Return the slot to the producer
    pub fn release(mut self, outcome: ReleaseOutcome) {
        let frame = self.frame.take().expect("reader owns its frame");
        self.ring.finish_release(self.index, frame, outcome);
    }
}

impl Drop for SlotReader<'_> {
    fn drop(&mut self) {
        // Dropped without an explicit release (panic path): count as dropped
        if let Some(frame) = self.frame.take() {
            self.ring.finish_release(self.index, frame, ReleaseOutcome::Dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fill(writer: &mut SlotWriter<'_>, seq: u8, ts: f64) {
        writer
            .frame_mut()
            .assign(&[seq; 16], 4, 2, PixelFormat::Yuyv, 8, ts);
    }

    #[test]
    fn test_publish_claim_release_cycle() {
        let ring = RawRing::new(2);

        let mut writer = ring.acquire_empty().unwrap();
        fill(&mut writer, 7, 1.0);
        let generation = writer.publish();
        assert_eq!(generation, 1);
        assert_eq!(ring.filled_len(), 1);

        let reader = ring.claim_filled(0).unwrap();
        assert_eq!(reader.generation(), 1);
        assert_eq!(reader.frame().payload(), &[7u8; 16]);
        reader.release(ReleaseOutcome::Encoded);

        assert_eq!(ring.counters().produced.load(Ordering::Relaxed), 1);
        assert_eq!(ring.counters().encoded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_generation_increments_per_refill() {
        let ring = RawRing::new(2);

        for expected in 1..=3u64 {
            let mut writer = ring.acquire_empty().unwrap();
            fill(&mut writer, expected as u8, expected as f64);
            writer.publish();
            let reader = ring.claim_filled(0).unwrap();
            // Both slots rotate; generation is per slot, so just check the
            // reader saw some positive generation and frames stay ordered
            assert!(reader.generation() >= 1);
            assert_eq!(reader.frame().payload()[0], expected as u8);
            reader.release(ReleaseOutcome::Encoded);
        }
    }

    #[test]
    fn test_claim_returns_oldest_first() {
        let ring = RawRing::new(3);

        for seq in [1u8, 2, 3] {
            let mut writer = ring.acquire_empty().unwrap();
            fill(&mut writer, seq, seq as f64);
            writer.publish();
        }

        for seq in [1u8, 2, 3] {
            let reader = ring.claim_filled(0).unwrap();
            assert_eq!(reader.frame().payload()[0], seq);
            reader.release(ReleaseOutcome::Encoded);
        }
    }

    #[test]
    fn test_producer_backpressure_and_wakeup() {
        let ring = Arc::new(RawRing::new(2));

        // Fill both slots and claim them: no empty slot remains
        let mut w = ring.acquire_empty().unwrap();
        fill(&mut w, 1, 1.0);
        w.publish();
        let mut w = ring.acquire_empty().unwrap();
        fill(&mut w, 2, 2.0);
        w.publish();
        let r1 = ring.claim_filled(0).unwrap();
        let r2 = ring.claim_filled(1).unwrap();

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                // Blocks until a slot is released
                let mut writer = ring.acquire_empty().unwrap();
                fill(&mut writer, 3, 3.0);
                writer.publish();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!producer.is_finished());

        r1.release(ReleaseOutcome::Encoded);
        producer.join().unwrap();
        r2.release(ReleaseOutcome::Encoded);
        assert_eq!(ring.filled_len(), 1);
    }

    #[test]
    fn test_dropped_writer_returns_slot() {
        let ring = RawRing::new(2);
        {
            let mut writer = ring.acquire_empty().unwrap();
            fill(&mut writer, 1, 1.0);
            // Dropped without publish
        }
        assert_eq!(ring.filled_len(), 0);
        // Both slots must still be acquirable
        let _a = ring.acquire_empty().unwrap();
        let _b = ring.acquire_empty().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_workers() {
        let ring = Arc::new(RawRing::new(2));
        let worker = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.claim_filled(0).is_none())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.close();
        assert!(worker.join().unwrap());
        assert!(ring.acquire_empty().is_none());
    }

    #[test]
    fn test_wait_all_released() {
        let ring = Arc::new(RawRing::new(2));
        let mut writer = ring.acquire_empty().unwrap();
        fill(&mut writer, 1, 1.0);
        writer.publish();
        let reader = ring.claim_filled(0).unwrap();
        ring.close();

        let waiter = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.wait_all_released())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        reader.release(ReleaseOutcome::Dropped);
        waiter.join().unwrap();
    }

    #[test]
    fn test_concurrent_producer_consumers() {
        let ring = Arc::new(RawRing::new(4));
        const FRAMES: usize = 200;

        let consumers: Vec<_> = (0..3u32)
            .map(|id| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(reader) = ring.claim_filled(id) {
                        seen.push(reader.frame().grab_ts);
                        reader.release(ReleaseOutcome::Encoded);
                    }
                    seen
                })
            })
            .collect();

        for seq in 0..FRAMES {
            let mut writer = ring.acquire_empty().unwrap();
            fill(&mut writer, (seq % 256) as u8, seq as f64);
            writer.publish();
        }
        // Let consumers drain before closing
        while ring.counters().encoded.load(Ordering::Relaxed) < FRAMES as u64 {
            std::thread::yield_now();
        }
        ring.close();

        let mut all: Vec<f64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        assert_eq!(all.len(), FRAMES);
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (i, ts) in all.iter().enumerate() {
            assert_eq!(*ts, i as f64);
        }
    }
}
