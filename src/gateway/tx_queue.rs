//! Outbound radio queue.
//!
//! Sessions hand encoded frames to the scheduler, which holds them here until
//! the channel is free. Frames that waited longer than the TTL are dropped
//! instead of being sent late; the queue is bounded to keep a burst of
//! replies from growing it without limit.

use log::warn;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default time-to-live for queued frames.
pub const DEFAULT_TX_TTL: Duration = Duration::from_secs(30);

/// Default queue capacity.
pub const DEFAULT_TX_CAPACITY: usize = 32;

/// An encoded frame bound for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    /// Session the frame is addressed to.
    pub session_id: u8,
    /// Packet name for logging.
    pub name: &'static str,
    pub frame: Vec<u8>,
}

/// A frame waiting for the channel.
#[derive(Clone, Debug)]
pub struct QueuedFrame {
    downlink: Downlink,
    queued_at: Instant,
}

impl QueuedFrame {
    pub fn new(downlink: Downlink) -> Self {
        Self::queued_at(downlink, Instant::now())
    }

    pub fn queued_at(downlink: Downlink, queued_at: Instant) -> Self {
        Self {
            downlink,
            queued_at,
        }
    }

    pub fn downlink(&self) -> &Downlink {
        &self.downlink
    }

    pub fn into_downlink(self) -> Downlink {
        self.downlink
    }

    /// Whether the frame waited longer than `ttl` at `now`.
    pub fn is_expired_at(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.queued_at) > ttl
    }
}

/// Why a frame was not queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueRejection {
    Full,
}

/// Bounded FIFO of outbound frames with TTL.
#[derive(Debug)]
pub struct TxQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
    ttl: Duration,
    expired: usize,
}

impl TxQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
            expired: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frames dropped for exceeding the TTL.
    pub fn expired(&self) -> usize {
        self.expired
    }

    pub fn push(&mut self, frame: QueuedFrame) -> Result<(), QueueRejection> {
        if self.frames.len() >= self.capacity {
            warn!(
                "TX queue full ({} frames), dropping {} for session 0x{:02X}",
                self.capacity,
                frame.downlink.name,
                frame.downlink.session_id
            );
            return Err(QueueRejection::Full);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Oldest frame still within its TTL at `now`. Expired frames ahead of it
    /// are discarded.
    pub fn pop_fresh(&mut self, now: Instant) -> Option<Downlink> {
        self.drop_expired(now);
        self.frames.pop_front().map(QueuedFrame::into_downlink)
    }

    /// Like [`pop_fresh`](Self::pop_fresh) but leaves the frame queued.
    pub fn peek_fresh(&mut self, now: Instant) -> Option<&Downlink> {
        self.drop_expired(now);
        self.frames.front().map(QueuedFrame::downlink)
    }

    fn drop_expired(&mut self, now: Instant) {
        while let Some(frame) = self.frames.front() {
            if !frame.is_expired_at(self.ttl, now) {
                break;
            }
            warn!(
                "Dropping stale {} for session 0x{:02X}",
                frame.downlink.name, frame.downlink.session_id
            );
            self.expired += 1;
            self.frames.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downlink(session_id: u8) -> Downlink {
        Downlink {
            session_id,
            name: "ConfigReply",
            frame: vec![0x02, session_id],
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = TxQueue::new(4, DEFAULT_TX_TTL);
        queue.push(QueuedFrame::new(downlink(1))).unwrap();
        queue.push(QueuedFrame::new(downlink(2))).unwrap();
        let now = Instant::now();
        assert_eq!(queue.pop_fresh(now).map(|d| d.session_id), Some(1));
        assert_eq!(queue.pop_fresh(now).map(|d| d.session_id), Some(2));
        assert!(queue.pop_fresh(now).is_none());
    }

    #[test]
    fn test_expired_frames_are_skipped() {
        let mut queue = TxQueue::new(4, Duration::from_secs(5));
        let now = Instant::now();
        let old = now - Duration::from_secs(10);
        queue
            .push(QueuedFrame::queued_at(downlink(1), old))
            .unwrap();
        queue.push(QueuedFrame::queued_at(downlink(2), now)).unwrap();

        assert_eq!(queue.pop_fresh(now).map(|d| d.session_id), Some(2));
        assert_eq!(queue.expired(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_frame_not_expired_before_ttl() {
        let now = Instant::now();
        let frame = QueuedFrame::queued_at(downlink(1), now - Duration::from_secs(4));
        assert!(!frame.is_expired_at(Duration::from_secs(5), now));
        assert!(frame.is_expired_at(Duration::from_secs(3), now));
    }

    #[test]
    fn test_peek_keeps_frame() {
        let mut queue = TxQueue::new(4, Duration::from_secs(5));
        let now = Instant::now();
        queue
            .push(QueuedFrame::queued_at(downlink(1), now - Duration::from_secs(6)))
            .unwrap();
        queue.push(QueuedFrame::queued_at(downlink(2), now)).unwrap();

        assert_eq!(queue.peek_fresh(now).map(|d| d.session_id), Some(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.expired(), 1);
        assert_eq!(queue.pop_fresh(now).map(|d| d.session_id), Some(2));
    }

    #[test]
    fn test_capacity_bound() {
        let mut queue = TxQueue::new(1, DEFAULT_TX_TTL);
        queue.push(QueuedFrame::new(downlink(1))).unwrap();
        assert_eq!(
            queue.push(QueuedFrame::new(downlink(2))),
            Err(QueueRejection::Full)
        );
        assert_eq!(queue.len(), 1);
    }
}
