//! Drop-same frame deduplication
//!
//! Static scenes compress to identical JPEGs, so suppressing repeats saves
//! bandwidth without visible effect. The window keeps the last N published
//! hashes; after N consecutive suppressions one frame is force-published so
//! idle clients still see a periodic keepalive.

use std::collections::VecDeque;

/// Maximum allowed dedup window
pub const MAX_WINDOW: u32 = 30;

/// Dedup state over encoded-payload hashes
#[derive(Debug)]
pub struct DropSame {
    window: usize,
    hashes: VecDeque<u64>,
    repeats: u32,
    force_next: bool,
}

impl DropSame {
    /// `window` of 0 disables dedup entirely
    pub fn new(window: u32) -> Self {
        let window = window.min(MAX_WINDOW) as usize;
        Self {
            window,
            hashes: VecDeque::with_capacity(window),
            repeats: 0,
            force_next: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    /// Decide whether a frame with this payload hash may publish
    pub fn admit(&mut self, hash: u64) -> bool {
        if self.window == 0 {
            return true;
        }

        if self.force_next {
            self.force_next = false;
            self.record(hash);
            return true;
        }

        if self.hashes.contains(&hash) {
            self.repeats += 1;
            if self.repeats >= self.window as u32 {
                self.repeats = 0;
                self.force_next = true;
            }
            return false;
        }

        self.record(hash);
        true
    }

    fn record(&mut self, hash: u64) {
        self.repeats = 0;
        if self.hashes.len() == self.window {
            self.hashes.pop_front();
        }
        self.hashes.push_back(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_admits_everything() {
        let mut dedup = DropSame::new(0);
        assert!(!dedup.is_enabled());
        for _ in 0..10 {
            assert!(dedup.admit(42));
        }
    }

    #[test]
    fn test_repeats_suppressed_until_keepalive() {
        let mut dedup = DropSame::new(3);
        assert!(dedup.admit(1));

        // Three repeats dropped, the fourth forced through
        assert!(!dedup.admit(1));
        assert!(!dedup.admit(1));
        assert!(!dedup.admit(1));
        assert!(dedup.admit(1));

        // The cycle repeats for a still-static scene
        assert!(!dedup.admit(1));
        assert!(!dedup.admit(1));
        assert!(!dedup.admit(1));
        assert!(dedup.admit(1));
    }

    #[test]
    fn test_changed_frame_publishes_immediately() {
        let mut dedup = DropSame::new(5);
        assert!(dedup.admit(1));
        assert!(!dedup.admit(1));
        assert!(dedup.admit(2));
        assert!(!dedup.admit(2));
        // Hash 1 is still inside the window
        assert!(!dedup.admit(1));
    }

    #[test]
    fn test_window_evicts_oldest_hash() {
        let mut dedup = DropSame::new(2);
        assert!(dedup.admit(1));
        assert!(dedup.admit(2));
        assert!(dedup.admit(3));
        // Hash 1 has been evicted, so it publishes again
        assert!(dedup.admit(1));
    }

    #[test]
    fn test_window_clamped_to_max() {
        let dedup = DropSame::new(100);
        assert_eq!(dedup.window, MAX_WINDOW as usize);
    }
}
