//! Lock-free runtime counters for the node.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared across the manager's loops and handlers.
pub struct NetworkStats {
    started: Instant,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub messages_deduplicated: AtomicU64,
    pub inferences_completed: AtomicU64,
    pub inferences_failed: AtomicU64,
    pub consensus_reached: AtomicU64,
    pub peers_evicted: AtomicU64,
}

/// Point-in-time copy of the counters, serializable for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub messages_deduplicated: u64,
    pub inferences_completed: u64,
    pub inferences_failed: u64,
    pub consensus_reached: u64,
    pub peers_evicted: u64,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_deduplicated: AtomicU64::new(0),
            inferences_completed: AtomicU64::new(0),
            inferences_failed: AtomicU64::new(0),
            consensus_reached: AtomicU64::new(0),
            peers_evicted: AtomicU64::new(0),
        }
    }
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed fraction of all finished inferences, `None` before the
    /// first sample.
    pub fn inference_success_rate(&self) -> Option<f64> {
        let completed = self.inferences_completed.load(Ordering::Relaxed);
        let failed = self.inferences_failed.load(Ordering::Relaxed);
        let total = completed + failed;
        if total == 0 {
            None
        } else {
            Some(completed as f64 / total as f64)
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_deduplicated: self.messages_deduplicated.load(Ordering::Relaxed),
            inferences_completed: self.inferences_completed.load(Ordering::Relaxed),
            inferences_failed: self.inferences_failed.load(Ordering::Relaxed),
            consensus_reached: self.consensus_reached.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_no_samples() {
        let stats = NetworkStats::new();
        assert_eq!(stats.inference_success_rate(), None);
    }

    #[test]
    fn test_success_rate() {
        let stats = NetworkStats::new();
        stats.inferences_completed.fetch_add(3, Ordering::Relaxed);
        stats.inferences_failed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.inference_success_rate(), Some(0.75));
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = NetworkStats::new();
        stats.messages_sent.fetch_add(7, Ordering::Relaxed);
        stats.messages_deduplicated.fetch_add(2, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 7);
        assert_eq!(snap.messages_deduplicated, 2);
        assert_eq!(snap.inferences_completed, 0);
    }
}
