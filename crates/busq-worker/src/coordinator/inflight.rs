use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use busq_core::models::QueueEntry;

/// Bounded FIFO of record ids believed ready. A cache, never a source of truth.
pub struct InflightQueue {
    ids: Mutex<VecDeque<i64>>,
    capacity: usize,
}

impl InflightQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<i64>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking push. Returns false when the FIFO is full.
    pub fn offer(&self, record_id: i64) -> bool {
        let mut ids = self.lock();
        if ids.len() >= self.capacity {
            return false;
        }
        ids.push_back(record_id);
        true
    }

    /// Pop up to `limit` ids, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<i64> {
        let mut ids = self.lock();
        let n = limit.min(ids.len());
        ids.drain(..n).collect()
    }

    /// Drop candidates whose id is already tracked by the FIFO. Returns the
    /// remaining candidates and how many were dropped.
    pub fn retain_untracked(&self, candidates: Vec<QueueEntry>) -> (Vec<QueueEntry>, usize) {
        let ids = self.lock();
        if ids.is_empty() {
            return (candidates, 0);
        }
        let tracked: HashSet<i64> = ids.iter().copied().collect();
        drop(ids);

        let before = candidates.len();
        let kept: Vec<QueueEntry> = candidates
            .into_iter()
            .filter(|e| !tracked.contains(&e.record_id))
            .collect();
        let removed = before - kept.len();
        (kept, removed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busq_core::models::{EventEnvelope, NewQueueEntry};
    use chrono::Utc;

    fn entry(record_id: i64) -> QueueEntry {
        NewQueueEntry::new(
            EventEnvelope {
                class_name: "test.event.v1".to_string(),
                payload: "{}".to_string(),
            },
            "node-a",
            Utc::now(),
        )
        .into_entry(record_id)
    }

    #[test]
    fn test_offer_respects_capacity() {
        let fifo = InflightQueue::new(2);
        assert!(fifo.offer(1));
        assert!(fifo.offer(2));
        assert!(!fifo.offer(3));
        assert_eq!(fifo.len(), 2);
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let fifo = InflightQueue::new(10);
        for id in 1..=5 {
            fifo.offer(id);
        }
        assert_eq!(fifo.drain(3), vec![1, 2, 3]);
        assert_eq!(fifo.drain(10), vec![4, 5]);
        assert!(fifo.drain(10).is_empty());
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_retain_untracked() {
        let fifo = InflightQueue::new(10);
        fifo.offer(2);
        fifo.offer(4);

        let (kept, removed) = fifo.retain_untracked(vec![entry(1), entry(2), entry(3)]);
        assert_eq!(removed, 1);
        assert_eq!(
            kept.iter().map(|e| e.record_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        // Tracked ids stay in the FIFO.
        assert_eq!(fifo.len(), 2);
    }
}
