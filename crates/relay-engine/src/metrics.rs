//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use relay_ipc::{ProcessRole, RelayMetrics, RoleMetrics};
use relay_transcoder::SupervisorStats;

#[derive(Default)]
struct DispatchCounters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchCounters {
    fn reset(&self) {
        self.forwarded.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    fn to_metrics(&self, stats: Option<&SupervisorStats>) -> RoleMetrics {
        let forwarded = self.forwarded.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        match stats {
            Some(stats) => stats.to_metrics(forwarded, dropped),
            None => RoleMetrics {
                chunks_forwarded: forwarded,
                chunks_dropped: dropped,
                ..Default::default()
            },
        }
    }
}

/// Supervisor counters of the current session.
#[derive(Clone, Default)]
pub struct SessionStats {
    pub live: Option<Arc<SupervisorStats>>,
    pub archival: Option<Arc<SupervisorStats>>,
}

/// Collects and reports relay metrics.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    chunks_received: AtomicU64,
    bytes_received: AtomicU64,
    live: DispatchCounters,
    archival: DispatchCounters,
    stats: RwLock<SessionStats>,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            chunks_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            live: DispatchCounters::default(),
            archival: DispatchCounters::default(),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    /// Start collecting for a new session.
    pub fn start(&self, stats: SessionStats) {
        self.chunks_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.live.reset();
        self.archival.reset();
        *self.stats.write() = stats;
        *self.start_time.write() = Some(Instant::now());
    }

    /// Stop the uptime clock. Counters stay readable.
    pub fn stop(&self) {
        if self.start_time.write().take().is_some() {
            debug!(metrics = ?self.snapshot(), "Session metrics");
        }
    }

    /// Record a chunk arriving from the producer.
    pub fn record_received(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a chunk handed to a supervisor.
    pub fn record_forwarded(&self, role: ProcessRole) {
        self.counters(role).forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk not handed to a supervisor.
    pub fn record_dropped(&self, role: ProcessRole) {
        self.counters(role).dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self, role: ProcessRole) -> &DispatchCounters {
        match role {
            ProcessRole::Live => &self.live,
            ProcessRole::Archival => &self.archival,
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> RelayMetrics {
        let stats = self.stats.read().clone();
        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        RelayMetrics {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            live: self.live.to_metrics(stats.live.as_deref()),
            archival: self.archival.to_metrics(stats.archival.as_deref()),
            uptime_seconds,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_role() {
        let metrics = MetricsCollector::new();
        metrics.start(SessionStats::default());

        metrics.record_received(10);
        metrics.record_forwarded(ProcessRole::Live);
        metrics.record_dropped(ProcessRole::Archival);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_received, 1);
        assert_eq!(snapshot.bytes_received, 10);
        assert_eq!(snapshot.live.chunks_forwarded, 1);
        assert_eq!(snapshot.live.chunks_dropped, 0);
        assert_eq!(snapshot.archival.chunks_dropped, 1);
    }

    #[test]
    fn test_start_resets_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_received(10);
        metrics.record_forwarded(ProcessRole::Live);

        metrics.start(SessionStats::default());

        assert_eq!(metrics.snapshot(), RelayMetrics::default());
    }
}
