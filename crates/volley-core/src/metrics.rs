use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::engine::RawResult;
use crate::error::Result;

const SIGNIFICANT_FIGURES: u8 = 3;
/// Latencies above one hour are recorded as one hour.
const MAX_TRACKED_NANOS: u64 = 3_600_000_000_000;

/// Latency distribution of every result seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub total: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
    pub min: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ByteMetrics {
    pub total: u64,
    pub mean: f64,
}

/// Cumulative aggregate at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub latencies: LatencyMetrics,
    pub bytes_in: ByteMetrics,
    pub bytes_out: ByteMetrics,
    /// Timestamp of the first request sent
    pub earliest: Option<DateTime<Utc>>,
    /// Timestamp of the last request sent
    pub latest: Option<DateTime<Utc>>,
    /// Time the last response was received
    pub end: Option<DateTime<Utc>>,
    /// `latest - earliest`
    pub duration: Duration,
    /// `end - latest`
    pub wait: Duration,
    pub requests: u64,
    /// Requests per second over `duration`
    pub rate: f64,
    /// Successful requests per second over `duration + wait`
    pub throughput: f64,
    /// Successful requests over all requests, in `[0, 1]`
    pub success: f64,
    pub status_codes: BTreeMap<u16, u64>,
    /// Distinct error messages, sorted
    pub errors: Vec<String>,
}

impl MetricsSnapshot {
    /// Whether a result counts towards the success ratio.
    pub fn is_success(result: &RawResult) -> bool {
        result.error.is_none() && (200..400).contains(&result.code)
    }
}

struct State {
    histogram: Histogram<u64>,
    total: Duration,
    max: Duration,
    min: Duration,
    bytes_in: u64,
    bytes_out: u64,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    requests: u64,
    successes: u64,
    status_codes: BTreeMap<u16, u64>,
    errors: BTreeSet<String>,
    finalized: bool,
}

/// Streaming statistics over the results of one attack.
///
/// `add` takes the write lock, `snapshot` the read lock, so a display task can
/// poll while the attack loop is feeding results.
pub struct MetricsAggregator {
    state: RwLock<State>,
}

impl MetricsAggregator {
    pub fn new() -> Result<Self> {
        let histogram =
            Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_NANOS, SIGNIFICANT_FIGURES)?;
        Ok(Self {
            state: RwLock::new(State {
                histogram,
                total: Duration::ZERO,
                max: Duration::ZERO,
                min: Duration::ZERO,
                bytes_in: 0,
                bytes_out: 0,
                earliest: None,
                latest: None,
                end: None,
                requests: 0,
                successes: 0,
                status_codes: BTreeMap::new(),
                errors: BTreeSet::new(),
                finalized: false,
            }),
        })
    }

    pub fn add(&self, result: &RawResult) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.finalized {
            debug!("Ignoring result after finalize");
            return;
        }

        state.requests += 1;
        if state.requests == 1 || result.latency < state.min {
            state.min = result.latency;
        }
        if result.latency > state.max {
            state.max = result.latency;
        }
        state.total = state.total.saturating_add(result.latency);
        state.histogram.saturating_record(nanos(result.latency));

        state.bytes_in += result.bytes_in;
        state.bytes_out += result.bytes_out;

        if state.earliest.map_or(true, |t| result.timestamp < t) {
            state.earliest = Some(result.timestamp);
        }
        if state.latest.map_or(true, |t| result.timestamp > t) {
            state.latest = Some(result.timestamp);
        }
        let end = result.end();
        if state.end.map_or(true, |t| end > t) {
            state.end = Some(end);
        }

        if MetricsSnapshot::is_success(result) {
            state.successes += 1;
        }
        *state.status_codes.entry(result.code).or_insert(0) += 1;
        if let Some(error) = &result.error {
            if !state.errors.contains(error) {
                state.errors.insert(error.clone());
            }
        }
    }

    /// Stop accepting results. The timing window is fixed from here on.
    pub fn finalize(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.finalized = true;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.requests == 0 {
            return MetricsSnapshot::default();
        }

        let requests = state.requests;
        let quantile = |q: f64| {
            let value = Duration::from_nanos(state.histogram.value_at_quantile(q));
            value.clamp(state.min, state.max)
        };

        let duration = span(state.earliest, state.latest);
        let wait = span(state.latest, state.end);
        let (rate, throughput) = if duration.is_zero() {
            (requests as f64, state.successes as f64)
        } else {
            (
                requests as f64 / duration.as_secs_f64(),
                state.successes as f64 / (duration + wait).as_secs_f64(),
            )
        };

        MetricsSnapshot {
            latencies: LatencyMetrics {
                total: state.total,
                mean: state.total / u32::try_from(requests).unwrap_or(u32::MAX),
                p50: quantile(0.50),
                p90: quantile(0.90),
                p95: quantile(0.95),
                p99: quantile(0.99),
                max: state.max,
                min: state.min,
            },
            bytes_in: ByteMetrics {
                total: state.bytes_in,
                mean: state.bytes_in as f64 / requests as f64,
            },
            bytes_out: ByteMetrics {
                total: state.bytes_out,
                mean: state.bytes_out as f64 / requests as f64,
            },
            earliest: state.earliest,
            latest: state.latest,
            end: state.end,
            duration,
            wait,
            requests,
            rate,
            throughput,
            success: state.successes as f64 / requests as f64,
            status_codes: state.status_codes.clone(),
            errors: state.errors.iter().cloned().collect(),
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn span(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => (to - from).to_std().unwrap_or(Duration::ZERO),
        _ => Duration::ZERO,
    }
}
