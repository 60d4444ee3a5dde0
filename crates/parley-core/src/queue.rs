//! Download admission queue.
//!
//! A global cap bounds how many downloads are active at once. Requests over
//! the cap wait here; whenever a slot frees, the smallest known download
//! among everything still waiting is admitted next. Downloads of unknown
//! size go after every sized one, in arrival order.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::transfer::RequestId;

/// Outcome of [`DownloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The download may start now
    Immediate,
    /// The download waits for a free slot
    Queued,
}

/// A download waiting for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownload {
    /// Request waiting
    pub request_id: RequestId,
    /// Announced size, if known
    pub size_bytes: Option<u64>,
    seq: u64,
}

impl QueuedDownload {
    fn sort_key(&self) -> (bool, u64, u64) {
        (
            self.size_bytes.is_none(),
            self.size_bytes.unwrap_or(u64::MAX),
            self.seq,
        )
    }
}

/// Bounded set of active downloads plus the waiting line.
#[derive(Debug)]
pub struct DownloadQueue {
    max_active: usize,
    max_queued: Option<usize>,
    active: HashSet<RequestId>,
    waiting: Vec<QueuedDownload>,
    next_seq: u64,
}

impl DownloadQueue {
    /// Create a queue admitting at most `max_active` downloads.
    ///
    /// `max_queued` optionally bounds the waiting line.
    #[must_use]
    pub fn new(max_active: usize, max_queued: Option<usize>) -> Self {
        Self {
            max_active: max_active.max(1),
            max_queued,
            active: HashSet::new(),
            waiting: Vec::new(),
            next_seq: 0,
        }
    }

    /// Admit a download now or put it in line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the waiting line is at its bound.
    pub fn enqueue(&mut self, request_id: RequestId, size_bytes: Option<u64>) -> Result<Admission> {
        if self.active.len() < self.max_active {
            self.active.insert(request_id);
            return Ok(Admission::Immediate);
        }

        if let Some(max) = self.max_queued {
            if self.waiting.len() >= max {
                return Err(Error::QueueFull(self.waiting.len()));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(QueuedDownload {
            request_id,
            size_bytes,
            seq,
        });
        tracing::debug!(
            request_id = %request_id,
            waiting = self.waiting.len(),
            "Download queued"
        );
        Ok(Admission::Queued)
    }

    /// Release the slot held by `request_id` and admit the next download.
    ///
    /// Returns the download admitted, if any. Releasing a request that holds
    /// no slot admits nothing.
    pub fn finish(&mut self, request_id: &RequestId) -> Option<QueuedDownload> {
        if !self.active.remove(request_id) {
            return None;
        }
        self.admit_next()
    }

    /// Remove a waiting download. Returns whether it was waiting.
    pub fn remove(&mut self, request_id: &RequestId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|q| &q.request_id != request_id);
        self.waiting.len() < before
    }

    /// Whether `request_id` holds an active slot.
    #[must_use]
    pub fn is_active(&self, request_id: &RequestId) -> bool {
        self.active.contains(request_id)
    }

    /// Whether `request_id` is waiting for admission.
    #[must_use]
    pub fn is_waiting(&self, request_id: &RequestId) -> bool {
        self.waiting.iter().any(|q| &q.request_id == request_id)
    }

    /// Number of active downloads.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Number of waiting downloads.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Drop every active and waiting download.
    pub fn reset(&mut self) {
        self.active.clear();
        self.waiting.clear();
        self.next_seq = 0;
    }

    fn admit_next(&mut self) -> Option<QueuedDownload> {
        if self.active.len() >= self.max_active {
            return None;
        }
        let index = self
            .waiting
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.sort_key())
            .map(|(i, _)| i)?;
        let next = self.waiting.remove(index);
        self.active.insert(next.request_id);
        tracing::debug!(
            request_id = %next.request_id,
            size = ?next.size_bytes,
            "Download admitted from queue"
        );
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_immediate_under_cap() {
        let mut queue = DownloadQueue::new(2, None);
        assert_eq!(queue.enqueue(Uuid::new_v4(), Some(1)).unwrap(), Admission::Immediate);
        assert_eq!(queue.enqueue(Uuid::new_v4(), Some(1)).unwrap(), Admission::Immediate);
        assert_eq!(queue.enqueue(Uuid::new_v4(), Some(1)).unwrap(), Admission::Queued);
        assert_eq!(queue.active_len(), 2);
        assert_eq!(queue.waiting_len(), 1);
    }

    #[test]
    fn test_smallest_waiting_download_admitted_first() {
        let mut queue = DownloadQueue::new(2, None);
        let big = Uuid::new_v4();
        let medium = Uuid::new_v4();
        let running = Uuid::new_v4();
        let small = Uuid::new_v4();

        queue.enqueue(big, Some(50 * MB)).unwrap();
        queue.enqueue(running, Some(5 * MB)).unwrap();
        assert_eq!(queue.enqueue(medium, Some(20 * MB)).unwrap(), Admission::Queued);
        assert_eq!(queue.enqueue(small, Some(MB)).unwrap(), Admission::Queued);

        assert_eq!(queue.finish(&running).unwrap().request_id, small);
        assert_eq!(queue.finish(&small).unwrap().request_id, medium);
        assert!(queue.finish(&medium).is_none());
    }

    #[test]
    fn test_unknown_size_goes_last_in_arrival_order() {
        let mut queue = DownloadQueue::new(1, None);
        let first = Uuid::new_v4();
        let unknown_a = Uuid::new_v4();
        let unknown_b = Uuid::new_v4();
        let sized = Uuid::new_v4();

        queue.enqueue(first, Some(1)).unwrap();
        queue.enqueue(unknown_a, None).unwrap();
        queue.enqueue(unknown_b, None).unwrap();
        queue.enqueue(sized, Some(100 * MB)).unwrap();

        assert_eq!(queue.finish(&first).unwrap().request_id, sized);
        assert_eq!(queue.finish(&sized).unwrap().request_id, unknown_a);
        assert_eq!(queue.finish(&unknown_a).unwrap().request_id, unknown_b);
    }

    #[test]
    fn test_equal_sizes_are_fifo() {
        let mut queue = DownloadQueue::new(1, None);
        let first = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(first, Some(1)).unwrap();
        queue.enqueue(a, Some(10)).unwrap();
        queue.enqueue(b, Some(10)).unwrap();

        assert_eq!(queue.finish(&first).unwrap().request_id, a);
    }

    #[test]
    fn test_queue_bound() {
        let mut queue = DownloadQueue::new(1, Some(1));
        queue.enqueue(Uuid::new_v4(), None).unwrap();
        queue.enqueue(Uuid::new_v4(), None).unwrap();
        assert!(matches!(
            queue.enqueue(Uuid::new_v4(), None),
            Err(Error::QueueFull(1))
        ));
    }

    #[test]
    fn test_remove_waiting_and_unknown_finish() {
        let mut queue = DownloadQueue::new(1, None);
        let active = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        queue.enqueue(active, None).unwrap();
        queue.enqueue(waiting, None).unwrap();

        assert!(queue.finish(&Uuid::new_v4()).is_none());
        assert!(queue.remove(&waiting));
        assert!(!queue.is_waiting(&waiting));
        assert!(queue.finish(&active).is_none());
        assert_eq!(queue.active_len(), 0);
    }

    #[test]
    fn test_reset() {
        let mut queue = DownloadQueue::new(1, None);
        let a = Uuid::new_v4();
        queue.enqueue(a, None).unwrap();
        queue.enqueue(Uuid::new_v4(), None).unwrap();
        queue.reset();
        assert!(!queue.is_active(&a));
        assert_eq!(queue.waiting_len(), 0);
    }
}
