//! Priority dispatch queue
//!
//! A bounded, thread-safe priority queue. Producers (scheduler flushes and the
//! instant path) enqueue from the poll thread; the sender thread blocks in
//! [`DispatchQueue::dequeue_timeout`]. Ordering is `(priority, sequence)`:
//! priority 1 always beats priority 2, and the enqueue sequence keeps FIFO
//! order within a tier.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::priority::Priority;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    /// Channel group name
    pub destination: String,
    pub body: String,
    pub alarm_type: String,
    pub priority: Priority,
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl Ord for QueuedMessage {
    // BinaryHeap is a max-heap: reverse so the smallest (priority, sequence)
    // is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedMessage>,
    next_sequence: u64,
}

pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a message, returning its sequence number.
    ///
    /// Fails when the queue is at capacity; nothing is dropped silently.
    pub fn enqueue(
        &self,
        destination: &str,
        body: &str,
        alarm_type: &str,
        priority: Priority,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.heap.len() >= self.capacity {
            bail!(
                "dispatch queue full ({} messages), rejected {} for {}",
                self.capacity,
                alarm_type,
                destination
            );
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueuedMessage {
            destination: destination.to_string(),
            body: body.to_string(),
            alarm_type: alarm_type.to_string(),
            priority,
            sequence,
            enqueued_at: Utc::now(),
        });
        drop(state);
        self.available.notify_one();
        Ok(sequence)
    }

    /// Pop the most urgent message, waiting up to `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(message) = state.heap.pop() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    pub fn try_dequeue(&self) -> Option<QueuedMessage> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .pop()
    }

    /// Pending messages in dispatch order
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages: Vec<QueuedMessage> = state.heap.iter().cloned().collect();
        // Reversed Ord: descending sort yields dispatch order
        messages.sort_by(|a, b| b.cmp(a));
        messages
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pending message, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = state.heap.len();
        state.heap.clear();
        removed
    }

    /// Wake any blocked consumer (used on shutdown)
    pub fn wake(&self) {
        self.available.notify_all();
    }
}

/// One delivered message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentRecord {
    pub destination: String,
    pub alarm_type: String,
    pub preview: String,
    pub sent_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Ring buffer of the most recent deliveries
pub struct SentHistory {
    records: Mutex<VecDeque<SentRecord>>,
    capacity: usize,
}

impl SentHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: SentRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<SentRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_priority_then_fifo() {
        let queue = DispatchQueue::new(10);
        queue.enqueue("G1", "a", "Low Voltage", Priority::Normal).unwrap();
        queue.enqueue("G2", "b", "AC Main Failure", Priority::Normal).unwrap();
        queue.enqueue("G3", "c", "CSL Fault", Priority::Instant).unwrap();
        queue.enqueue("G4", "d", "CSL Fault", Priority::Instant).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|m| m.destination)
            .collect();

        assert_eq!(order, vec!["G3", "G4", "G1", "G2"]);
    }

    #[test]
    fn test_snapshot_matches_dispatch_order() {
        let queue = DispatchQueue::new(10);
        queue.enqueue("G1", "a", "Low Voltage", Priority::Normal).unwrap();
        queue.enqueue("G2", "b", "CSL Fault", Priority::Instant).unwrap();

        let snapshot: Vec<String> = queue.snapshot().into_iter().map(|m| m.destination).collect();

        assert_eq!(snapshot, vec!["G2", "G1"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = DispatchQueue::new(1);
        queue.enqueue("G1", "a", "Low Voltage", Priority::Normal).unwrap();

        let err = queue
            .enqueue("G2", "b", "CSL Fault", Priority::Instant)
            .unwrap_err();

        assert!(err.to_string().contains("full"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_timeout_empty() {
        let queue = DispatchQueue::new(1);
        let started = Instant::now();
        assert!(queue.dequeue_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(DispatchQueue::new(4));
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer
                .enqueue("G1", "a", "CSL Fault", Priority::Instant)
                .unwrap();
        });

        let message = queue.dequeue_timeout(Duration::from_secs(5));
        handle.join().unwrap();

        assert_eq!(message.unwrap().destination, "G1");
    }

    #[test]
    fn test_clear() {
        let queue = DispatchQueue::new(4);
        queue.enqueue("G1", "a", "Low Voltage", Priority::Normal).unwrap();
        queue.enqueue("G2", "b", "Low Voltage", Priority::Normal).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_history_ring() {
        let history = SentHistory::new(2);
        for name in ["a", "b", "c"] {
            history.push(SentRecord {
                destination: name.to_string(),
                alarm_type: "Low Voltage".to_string(),
                preview: String::new(),
                sent_at: Utc::now(),
                attempts: 1,
            });
        }

        let kept: Vec<String> = history.snapshot().into_iter().map(|r| r.destination).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }
}
