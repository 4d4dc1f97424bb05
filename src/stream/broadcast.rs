//! Frame fan-out
//!
//! One `Broadcaster` feeds every HTTP session and auxiliary sink through a
//! single-slot latest-wins mailbox (`tokio::sync::watch`). A subscriber
//! that falls behind simply misses intermediate frames; nothing it does can
//! stall the coordinator. Frames are `Arc`-shared, so fan-out never copies
//! pixel data.

use std::sync::Arc;

use tokio::sync::watch;

use crate::stream::frame::EncodedFrame;

/// Value held by the mailbox
#[derive(Debug, Clone, Default)]
enum Signal {
    /// Nothing published yet
    #[default]
    Empty,
    Frame(Arc<EncodedFrame>),
    /// Stream is shutting down; subscribers should close
    Eof,
}

/// Publisher half plus subscription registry
#[derive(Debug)]
pub struct Broadcaster {
    tx: watch::Sender<Signal>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Signal::Empty);
        Self { tx }
    }

    /// Swap the current frame and notify every subscriber
    pub fn publish(&self, frame: Arc<EncodedFrame>) {
        // send only fails with zero receivers; the value still updates for
        // future subscribers, which send_replace guarantees
        self.tx.send_replace(Signal::Frame(frame));
    }

    /// Tell all subscribers the stream has ended
    pub fn close(&self) {
        self.tx.send_replace(Signal::Eof);
    }

    /// The most recently published frame, if any
    pub fn current(&self) -> Option<Arc<EncodedFrame>> {
        match &*self.tx.borrow() {
            Signal::Frame(frame) => Some(Arc::clone(frame)),
            _ => None,
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
            last_seq: 0,
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half held by one session
///
/// Tracks the last delivered sequence number so deliveries to this
/// subscriber are strictly increasing even across mailbox overwrites.
#[derive(Debug)]
pub struct Subscriber {
    rx: watch::Receiver<Signal>,
    last_seq: u64,
}

impl Subscriber {
    /// Wait for a frame newer than the last one delivered here
    ///
    /// Returns `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<Arc<EncodedFrame>> {
        loop {
            {
                let signal = self.rx.borrow_and_update();
                match &*signal {
                    Signal::Frame(frame) if frame.published_seq > self.last_seq => {
                        let frame = Arc::clone(frame);
                        drop(signal);
                        self.last_seq = frame.published_seq;
                        return Some(frame);
                    }
                    Signal::Eof => return None,
                    _ => {}
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Sequence number of the last frame delivered to this subscriber
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64) -> Arc<EncodedFrame> {
        let mut f = EncodedFrame::synthetic(Bytes::from_static(b"\xff\xd8\xff\xd9"), 4, 4, seq as f64, true);
        f.published_seq = seq;
        Arc::new(f)
    }

    #[tokio::test]
    async fn test_subscriber_sees_published_frames_in_order() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();

        broadcaster.publish(frame(1));
        assert_eq!(sub.next().await.unwrap().published_seq, 1);

        broadcaster.publish(frame(2));
        broadcaster.publish(frame(3));
        // Mailbox overwrote 2; only the latest arrives
        assert_eq!(sub.next().await.unwrap().published_seq, 3);
        assert_eq!(sub.last_seq(), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_frame() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(frame(5));

        let mut sub = broadcaster.subscribe();
        assert_eq!(sub.next().await.unwrap().published_seq, 5);
    }

    #[tokio::test]
    async fn test_eof_ends_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();
        broadcaster.publish(frame(1));
        assert!(sub.next().await.is_some());

        broadcaster.close();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sender_drop_ends_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();
        drop(broadcaster);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_current_and_counts() {
        let broadcaster = Broadcaster::new();
        assert!(broadcaster.current().is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);

        let _sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(frame(9));
        assert_eq!(broadcaster.current().unwrap().published_seq, 9);
    }
}
