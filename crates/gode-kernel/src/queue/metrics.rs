// Operation queue metrics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub pending_work: usize,
    pub total_submitted: u64,
    pub total_executed: u64,
    pub total_failed: u64,
    /// Submissions discarded because the queue was closed
    pub total_dropped: u64,
}

// Lock-free atomic counters
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub total_submitted: AtomicU64,
    pub total_executed: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_dropped: AtomicU64,
}

impl QueueCounters {
    pub fn record_submit(&self) {
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_executed(&self) {
        self.total_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.total_executed.fetch_add(1, Ordering::Relaxed);
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.total_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_depth: usize, pending_work: usize) -> QueueMetrics {
        QueueMetrics {
            queue_depth,
            pending_work,
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_executed: self.total_executed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }
}
