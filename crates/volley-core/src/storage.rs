use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::engine::RawResult;
use crate::metrics::MetricsSnapshot;

pub const LATENCY: &str = "latency";
pub const P50: &str = "p50";
pub const P90: &str = "p90";
pub const P95: &str = "p95";
pub const P99: &str = "p99";

/// Every series written on insert.
pub const METRICS: [&str; 5] = [LATENCY, P50, P90, P95, P99];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// One row for the live chart series, values in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord {
    pub code: u16,
    pub timestamp: DateTime<Utc>,
    pub latency: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl StorageRecord {
    /// Pairs a result with the cumulative percentiles after it was added.
    pub fn new(result: &RawResult, snapshot: &MetricsSnapshot) -> Self {
        Self {
            code: result.code,
            timestamp: result.timestamp,
            latency: millis(result.latency),
            p50: millis(snapshot.latencies.p50),
            p90: millis(snapshot.latencies.p90),
            p95: millis(snapshot.latencies.p95),
            p99: millis(snapshot.latencies.p99),
        }
    }

    fn values(&self) -> [(&'static str, f64); 5] {
        [
            (LATENCY, self.latency),
            (P50, self.p50),
            (P90, self.p90),
            (P95, self.p95),
            (P99, self.p99),
        ]
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

pub trait StorageWriter: Send + Sync {
    fn insert(&self, record: &StorageRecord) -> Result<(), StorageError>;
}

pub trait StorageReader: Send + Sync {
    /// Values of `metric` with `start <= timestamp < end`, in time order.
    fn select(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, StorageError>;
}

pub trait Storage: StorageWriter + StorageReader {}

impl<T: StorageWriter + StorageReader> Storage for T {}

type Series = BTreeMap<i64, Vec<f64>>;

/// In-process time series keyed by nanosecond timestamps.
#[derive(Default)]
pub struct MemoryStorage {
    series: RwLock<HashMap<&'static str, Series>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored for `metric`.
    pub fn points(&self, metric: &str) -> usize {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        series
            .get(metric)
            .map_or(0, |points| points.values().map(Vec::len).sum())
    }
}

fn key(timestamp: DateTime<Utc>) -> i64 {
    timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| timestamp.timestamp_micros().saturating_mul(1000))
}

impl StorageWriter for MemoryStorage {
    fn insert(&self, record: &StorageRecord) -> Result<(), StorageError> {
        let ts = key(record.timestamp);
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        for (metric, value) in record.values() {
            series
                .entry(metric)
                .or_default()
                .entry(ts)
                .or_default()
                .push(value);
        }
        Ok(())
    }
}

impl StorageReader for MemoryStorage {
    fn select(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, StorageError> {
        let (start, end) = (key(start), key(end));
        if start >= end {
            return Ok(Vec::new());
        }
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series
            .get(metric)
            .map(|points| {
                points
                    .range(start..end)
                    .flat_map(|(_, values)| values.iter().copied())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(base: DateTime<Utc>, offset_ms: i64, latency: f64) -> StorageRecord {
        StorageRecord {
            code: 200,
            timestamp: base + TimeDelta::milliseconds(offset_ms),
            latency,
            p50: latency / 2.0,
            p90: latency,
            p95: latency,
            p99: latency,
        }
    }

    #[test]
    fn test_insert_writes_every_series() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert(&record(now, 0, 12.5)).unwrap();
        for metric in METRICS {
            assert_eq!(storage.points(metric), 1, "{metric}");
        }
        assert_eq!(storage.points("unknown"), 0);
    }

    #[test]
    fn test_select_half_open_range() {
        let storage = MemoryStorage::new();
        let base = Utc::now();
        for (i, latency) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            storage.insert(&record(base, i as i64 * 100, latency)).unwrap();
        }

        let values = storage
            .select(LATENCY, base, base + TimeDelta::milliseconds(300))
            .unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);

        let values = storage
            .select(P50, base + TimeDelta::milliseconds(100), base + TimeDelta::seconds(1))
            .unwrap();
        assert_eq!(values, vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_select_unknown_or_empty_range() {
        let storage = MemoryStorage::new();
        let base = Utc::now();
        storage.insert(&record(base, 0, 1.0)).unwrap();
        assert!(storage
            .select("bogus", base, base + TimeDelta::seconds(1))
            .unwrap()
            .is_empty());
        assert!(storage.select(LATENCY, base, base).unwrap().is_empty());
    }

    #[test]
    fn test_same_timestamp_keeps_both_points() {
        let storage = MemoryStorage::new();
        let base = Utc::now();
        storage.insert(&record(base, 0, 1.0)).unwrap();
        storage.insert(&record(base, 0, 2.0)).unwrap();
        let values = storage
            .select(LATENCY, base, base + TimeDelta::milliseconds(1))
            .unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_record_from_snapshot_in_millis() {
        let result = RawResult {
            code: 201,
            timestamp: Utc::now(),
            latency: Duration::from_micros(1500),
            bytes_in: 0,
            bytes_out: 0,
            error: None,
        };
        let mut snapshot = MetricsSnapshot::default();
        snapshot.latencies.p99 = Duration::from_millis(40);
        let record = StorageRecord::new(&result, &snapshot);
        assert_eq!(record.code, 201);
        assert_eq!(record.latency, 1.5);
        assert_eq!(record.p99, 40.0);
        assert_eq!(record.p50, 0.0);
    }
}
