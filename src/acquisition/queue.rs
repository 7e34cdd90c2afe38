//! Per-device bounded priority queue
//!
//! Requests are ordered by priority (descending) and enqueue time
//! (ascending) within a priority class. There is no aging: a steady
//! stream of higher-priority requests may defer lower ones indefinitely.

use std::collections::BinaryHeap;

use crate::error::{AcqSrvError, Result};
use crate::point::{QueuedRequest, RequestPriority};

/// Default per-device queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A request removed by [`PriorityQueue::clear`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptedRequest {
    pub request_id: u64,
    pub reason: String,
}

/// Bounded priority queue for one device.
#[derive(Debug)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueuedRequest>,
    capacity: usize,
    /// Entry counts per priority, for O(1) `has_higher_than`.
    counts: [usize; 4],
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
            capacity,
            counts: [0; 4],
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a request; fails with `QueueFull` at capacity.
    pub fn enqueue(&mut self, request: QueuedRequest) -> Result<()> {
        if self.heap.len() >= self.capacity {
            return Err(AcqSrvError::QueueFull(format!(
                "queue at capacity {}",
                self.capacity
            )));
        }
        self.counts[request.priority as usize] += 1;
        self.heap.push(request);
        Ok(())
    }

    /// Remove and return the head request.
    pub fn dequeue(&mut self) -> Option<QueuedRequest> {
        let request = self.heap.pop()?;
        self.counts[request.priority as usize] -= 1;
        Some(request)
    }

    /// Drain all entries, reporting each as interrupted.
    pub fn clear(&mut self, reason: &str) -> Vec<InterruptedRequest> {
        self.counts = [0; 4];
        self.heap
            .drain()
            .map(|qr| InterruptedRequest {
                request_id: qr.request_id,
                reason: reason.to_string(),
            })
            .collect()
    }

    /// Whether any queued request outranks the given priority.
    pub fn has_higher_than(&self, priority: RequestPriority) -> bool {
        self.counts[(priority as usize + 1)..4]
            .iter()
            .any(|&count| count > 0)
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{DataType, Request, RequestKind};

    fn request() -> Request {
        Request {
            kind: RequestKind::ReadHolding,
            start_address: 0,
            count: 1,
            unit_id: 1,
            data_type: DataType::Reg16,
        }
    }

    fn queued(priority: RequestPriority, id: u64, time: i64) -> QueuedRequest {
        QueuedRequest {
            request: request(),
            priority,
            request_id: id,
            enqueue_time_ms: time,
            interruptible: false,
        }
    }

    #[test]
    fn test_strict_priority_ordering() {
        let mut q = PriorityQueue::default();
        q.enqueue(queued(RequestPriority::Low, 1, 1)).unwrap();
        q.enqueue(queued(RequestPriority::Critical, 2, 2)).unwrap();
        q.enqueue(queued(RequestPriority::Normal, 3, 3)).unwrap();
        q.enqueue(queued(RequestPriority::High, 4, 4)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| q.dequeue().map(|r| r.request_id)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = PriorityQueue::default();
        q.enqueue(queued(RequestPriority::Normal, 1, 10)).unwrap();
        q.enqueue(queued(RequestPriority::Normal, 2, 20)).unwrap();
        q.enqueue(queued(RequestPriority::Normal, 3, 30)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| q.dequeue().map(|r| r.request_id)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_fifo_same_millisecond_uses_request_id() {
        let mut q = PriorityQueue::default();
        q.enqueue(queued(RequestPriority::Normal, 2, 10)).unwrap();
        q.enqueue(queued(RequestPriority::Normal, 1, 10)).unwrap();

        assert_eq!(q.dequeue().unwrap().request_id, 1);
        assert_eq!(q.dequeue().unwrap().request_id, 2);
    }

    #[test]
    fn test_capacity_rejection() {
        let mut q = PriorityQueue::new(2);
        q.enqueue(queued(RequestPriority::Normal, 1, 1)).unwrap();
        q.enqueue(queued(RequestPriority::Normal, 2, 2)).unwrap();

        let err = q.enqueue(queued(RequestPriority::Critical, 3, 3)).unwrap_err();
        assert!(matches!(err, AcqSrvError::QueueFull(_)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_clear_reports_interrupted() {
        let mut q = PriorityQueue::default();
        q.enqueue(queued(RequestPriority::Normal, 1, 1)).unwrap();
        q.enqueue(queued(RequestPriority::High, 2, 2)).unwrap();

        let interrupted = q.clear("shutdown");
        assert_eq!(interrupted.len(), 2);
        assert!(interrupted.iter().all(|i| i.reason == "shutdown"));
        assert!(q.is_empty());
        assert!(!q.has_higher_than(RequestPriority::Low));
    }

    #[test]
    fn test_has_higher_than() {
        let mut q = PriorityQueue::default();
        assert!(!q.has_higher_than(RequestPriority::Low));

        q.enqueue(queued(RequestPriority::Normal, 1, 1)).unwrap();
        assert!(q.has_higher_than(RequestPriority::Low));
        assert!(!q.has_higher_than(RequestPriority::Normal));

        q.enqueue(queued(RequestPriority::Critical, 2, 2)).unwrap();
        assert!(q.has_higher_than(RequestPriority::High));
        assert!(!q.has_higher_than(RequestPriority::Critical));

        q.dequeue(); // removes the critical entry
        assert!(!q.has_higher_than(RequestPriority::High));
    }
}
