//! Bridge statistics
//!
//! Counters shared by the fan-in listeners and the writer task. Every update
//! is a single atomic increment; snapshots are plain atomic loads so they can
//! be taken while the service is running.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::shutdown::{self, ShutdownReceiver};

/// Name of the statistics block
pub const STATISTICS_NAME: &str = "eii";

/// Points accepted into the batcher
pub const STAT_POINTS_RECEIVED: &str = "pointsRx";
/// Transport read errors
pub const STAT_READ_FAIL: &str = "readFail";
/// Batches written to storage
pub const STAT_BATCHES_TRANSMITTED: &str = "batchesTx";
/// Points written to storage
pub const STAT_POINTS_TRANSMITTED: &str = "pointsTx";
/// Batches whose write failed
pub const STAT_BATCHES_TRANSMIT_FAIL: &str = "batchesTxFail";
/// Messages dropped because they could not be converted
pub const STAT_DROPPED_POINTS_INVALID: &str = "droppedPointsInvalid";

/// Ingestion statistics
#[derive(Debug, Default)]
pub struct Statistics {
    points_received: AtomicU64,
    read_fail: AtomicU64,
    batches_transmitted: AtomicU64,
    points_transmitted: AtomicU64,
    batches_transmit_fail: AtomicU64,
    dropped_points_invalid: AtomicU64,
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Points accepted into the batcher
    pub points_received: u64,
    /// Transport read errors
    pub read_fail: u64,
    /// Batches written to storage
    pub batches_transmitted: u64,
    /// Points written to storage
    pub points_transmitted: u64,
    /// Batches whose write failed
    pub batches_transmit_fail: u64,
    /// Messages dropped because they could not be converted
    pub dropped_points_invalid: u64,
}

/// A named, tagged statistics block for periodic external polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistic {
    /// Block name
    pub name: String,
    /// Tags attached to the block
    pub tags: BTreeMap<String, String>,
    /// Counter values by statistic name
    pub values: BTreeMap<String, u64>,
}

impl Statistics {
    /// Create a new shared statistics handle
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one point accepted into the batcher
    pub fn record_point_received(&self) {
        self.points_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one transport read error
    pub fn record_read_fail(&self) {
        self.read_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully written batch of `points` points
    pub fn record_batch_transmitted(&self, points: usize) {
        self.batches_transmitted.fetch_add(1, Ordering::Relaxed);
        self.points_transmitted
            .fetch_add(u64::try_from(points).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Record a failed batch write
    pub fn record_batch_transmit_fail(&self) {
        self.batches_transmit_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped during conversion
    pub fn record_dropped_invalid(&self) {
        self.dropped_points_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            points_received: self.points_received.load(Ordering::Relaxed),
            read_fail: self.read_fail.load(Ordering::Relaxed),
            batches_transmitted: self.batches_transmitted.load(Ordering::Relaxed),
            points_transmitted: self.points_transmitted.load(Ordering::Relaxed),
            batches_transmit_fail: self.batches_transmit_fail.load(Ordering::Relaxed),
            dropped_points_invalid: self.dropped_points_invalid.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsSnapshot {
    /// Counter values keyed by their published statistic names
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, u64> {
        [
            (STAT_POINTS_RECEIVED, self.points_received),
            (STAT_READ_FAIL, self.read_fail),
            (STAT_BATCHES_TRANSMITTED, self.batches_transmitted),
            (STAT_POINTS_TRANSMITTED, self.points_transmitted),
            (STAT_BATCHES_TRANSMIT_FAIL, self.batches_transmit_fail),
            (STAT_DROPPED_POINTS_INVALID, self.dropped_points_invalid),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

impl Statistic {
    /// Build the statistics block, caller tags override default tags
    #[must_use]
    pub fn from_snapshot(
        snapshot: &StatisticsSnapshot,
        default_tags: &BTreeMap<String, String>,
        tags: &BTreeMap<String, String>,
    ) -> Self {
        let mut merged = default_tags.clone();
        merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            name: STATISTICS_NAME.to_string(),
            tags: merged,
            values: snapshot.values(),
        }
    }
}

/// Log a statistics snapshot every `interval` until shutdown is signalled
pub async fn report_periodically(
    stats: Arc<Statistics>,
    interval: Duration,
    mut shutdown: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = shutdown::signalled(&mut shutdown) => break,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                tracing::info!(
                    points_rx = s.points_received,
                    read_fail = s.read_fail,
                    batches_tx = s.batches_transmitted,
                    points_tx = s.points_transmitted,
                    batches_tx_fail = s.batches_transmit_fail,
                    dropped_points_invalid = s.dropped_points_invalid,
                    "Ingestion statistics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::default();
        stats.record_point_received();
        stats.record_point_received();
        stats.record_read_fail();
        stats.record_batch_transmitted(2);
        stats.record_batch_transmit_fail();
        stats.record_dropped_invalid();

        let s = stats.snapshot();
        assert_eq!(s.points_received, 2);
        assert_eq!(s.read_fail, 1);
        assert_eq!(s.batches_transmitted, 1);
        assert_eq!(s.points_transmitted, 2);
        assert_eq!(s.batches_transmit_fail, 1);
        assert_eq!(s.dropped_points_invalid, 1);
    }

    #[test]
    fn test_statistic_tags_merge() {
        let stats = Statistics::default();
        stats.record_point_received();

        let defaults = BTreeMap::from([
            ("host".to_string(), "edge-1".to_string()),
            ("bind".to_string(), "default".to_string()),
        ]);
        let tags = BTreeMap::from([("bind".to_string(), "override".to_string())]);

        let stat = Statistic::from_snapshot(&stats.snapshot(), &defaults, &tags);
        assert_eq!(stat.name, "eii");
        assert_eq!(stat.tags.get("host").map(String::as_str), Some("edge-1"));
        assert_eq!(stat.tags.get("bind").map(String::as_str), Some("override"));
        assert_eq!(stat.values.get(STAT_POINTS_RECEIVED), Some(&1));
        assert_eq!(stat.values.len(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let stats = Statistics::shared();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    stats.record_point_received();
                }
            }));
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }
        assert_eq!(stats.snapshot().points_received, 8000);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let (tx, rx) = shutdown::channel();
        let reporter = tokio::spawn(report_periodically(
            Statistics::shared(),
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
        let joined = tokio::time::timeout(Duration::from_secs(1), reporter).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
