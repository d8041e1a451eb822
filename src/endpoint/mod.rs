//! # Endpoints
//!
//! The two transport endpoints of the routing core:
//!
//! - [`sender`]: the connection-oriented client endpoint that carries the
//!   routing protocol to the routing host (and to peer applications);
//! - [`udp`]: the connection-less UDP server endpoint for wire-side
//!   SOME/IP traffic.
//!
//! Both share the same send-queue discipline: per target, an ordered queue
//! of `(buffer, separation_time)` entries under a byte budget, with at most
//! one asynchronous send outstanding.

pub mod sender;
pub mod udp;

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::warn;

/// One queued transmission.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub buffer: Bytes,
    /// Minimum spacing to the previous transmission, microseconds. Only TP
    /// segments carry a non-zero value.
    pub separation_time_us: u32,
}

/// Ordered send queue with byte accounting.
///
/// Invariant: `bytes` equals the sum of the queued buffer sizes at every
/// observation point.
#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<QueueEntry>,
    bytes: usize,
    limit: Option<usize>,
}

impl SendQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Whether `size` more bytes fit under the budget. Detects and repairs
    /// accounting drift before deciding.
    pub fn check_limit(&mut self, size: usize) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        if self.bytes >= limit {
            let stale = self.bytes;
            self.recalculate();
            if stale != self.bytes {
                warn!(
                    "send queue: repaired byte accounting ({} -> {})",
                    stale, self.bytes
                );
            }
        }

        match self.bytes.checked_add(size) {
            Some(total) => total <= limit,
            None => false,
        }
    }

    pub fn push(&mut self, buffer: Bytes, separation_time_us: u32) {
        self.bytes += buffer.len();
        self.entries.push_back(QueueEntry {
            buffer,
            separation_time_us,
        });
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Retire the head entry after its send completed.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front()?;
        let size = entry.buffer.len();
        if size <= self.bytes {
            self.bytes -= size;
        } else {
            warn!(
                "send queue: prevented byte underflow (bytes {}, popped {})",
                self.bytes, size
            );
            self.recalculate();
        }
        Some(entry)
    }

    fn recalculate(&mut self) {
        self.bytes = self.entries.iter().map(|e| e.buffer.len()).sum();
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_accounting_tracks_entries() {
        let mut queue = SendQueue::new(None);
        queue.push(Bytes::from_static(&[0u8; 100]), 0);
        queue.push(Bytes::from_static(&[0u8; 50]), 10);
        assert_eq!(queue.bytes(), 150);
        assert_eq!(queue.len(), 2);

        let entry = queue.pop().unwrap();
        assert_eq!(entry.buffer.len(), 100);
        assert_eq!(queue.bytes(), 50);

        queue.pop().unwrap();
        assert_eq!(queue.bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn limit_enforced_with_overflow_guard() {
        let mut queue = SendQueue::new(Some(120));
        assert!(queue.check_limit(100));
        queue.push(Bytes::from_static(&[0u8; 100]), 0);
        assert!(!queue.check_limit(100));
        assert!(queue.check_limit(20));
        assert!(!queue.check_limit(usize::MAX));
    }

    #[test]
    fn clear_resets_accounting() {
        let mut queue = SendQueue::new(Some(1000));
        queue.push(Bytes::from_static(&[0u8; 100]), 0);
        queue.clear();
        assert_eq!(queue.bytes(), 0);
        assert!(queue.check_limit(1000));
    }
}
