use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::metrics::{ByteMetrics, MetricsSnapshot};

/// Finalized report of one run, written next to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub target: TargetSummary,
    pub parameters: ParametersSummary,
    pub timing: TimingSummary,
    pub requests: RequestsSummary,
    pub throughput: f64,
    pub latency_ms: LatencySummary,
    pub bytes: BytesSummary,
    /// Keyed by status code, serialized in ascending code order
    pub status_codes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub url: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSummary {
    pub rate: u64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsSummary {
    pub count: u64,
    pub success_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub total: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytesSummary {
    #[serde(rename = "in")]
    pub bytes_in: FlowSummary,
    #[serde(rename = "out")]
    pub bytes_out: FlowSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub total: u64,
    pub mean: f64,
}

impl From<&ByteMetrics> for FlowSummary {
    fn from(bytes: &ByteMetrics) -> Self {
        Self {
            total: bytes.total,
            mean: bytes.mean,
        }
    }
}

impl Summary {
    pub fn new(
        url: &str,
        method: &str,
        rate: u64,
        duration: Duration,
        metrics: &MetricsSnapshot,
    ) -> Self {
        let latencies = &metrics.latencies;
        let status_codes = metrics
            .status_codes
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect();

        Self {
            target: TargetSummary {
                url: url.to_string(),
                method: method.to_string(),
            },
            parameters: ParametersSummary {
                rate,
                duration_seconds: duration.as_secs_f64(),
            },
            timing: TimingSummary {
                earliest: metrics.earliest,
                latest: metrics.latest,
            },
            requests: RequestsSummary {
                count: metrics.requests,
                success_ratio: metrics.success,
            },
            throughput: metrics.throughput,
            latency_ms: LatencySummary {
                total: millis(latencies.total),
                mean: millis(latencies.mean),
                p50: millis(latencies.p50),
                p90: millis(latencies.p90),
                p95: millis(latencies.p95),
                p99: millis(latencies.p99),
                max: millis(latencies.max),
                min: millis(latencies.min),
            },
            bytes: BytesSummary {
                bytes_in: FlowSummary::from(&metrics.bytes_in),
                bytes_out: FlowSummary::from(&metrics.bytes_out),
            },
            status_codes,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
