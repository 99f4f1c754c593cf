//! Anomaly detection over a record set
//!
//! Three detectors run over records sorted by timestamp:
//! - Response-time spikes against the mean of the other records
//! - Error-rate spikes in a sliding window
//! - Throughput dips between consecutive one-minute buckets

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::trend::{time_series, TimeSeriesMetric};
use crate::record::RequestRecord;

/// Fewer records than this yields no anomalies
pub const MIN_RECORDS: usize = 10;

const SPIKE_FACTOR: f64 = 3.0;
const SPIKE_HIGH_FACTOR: f64 = 6.0;

const ERROR_WINDOW: usize = 10;
const ERROR_RATE_THRESHOLD: f64 = 0.10;
const ERROR_RATE_HIGH: f64 = 0.50;

const THROUGHPUT_BUCKET: Duration = Duration::from_secs(60);
const THROUGHPUT_DROP: f64 = 0.50;
const THROUGHPUT_DROP_HIGH: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Single response far slower than the rest
    Spike,
    ErrorRate,
    ThroughputDip,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Spike => "spike",
            AnomalyKind::ErrorRate => "error_rate",
            AnomalyKind::ThroughputDip => "throughput_dip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Observed value (ms, fraction or requests per bucket)
    pub value: f64,
    /// What the value was compared against
    pub baseline: f64,
    pub description: String,
}

pub fn detect_anomalies(records: &[RequestRecord]) -> Vec<Anomaly> {
    if records.len() < MIN_RECORDS {
        return Vec::new();
    }

    let mut sorted: Vec<&RequestRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let mut anomalies = detect_spikes(&sorted);
    anomalies.extend(detect_error_windows(&sorted));
    anomalies.extend(detect_throughput_dips(records));
    anomalies.sort_by_key(|a| a.timestamp);
    anomalies
}

fn detect_spikes(records: &[&RequestRecord]) -> Vec<Anomaly> {
    let timed: Vec<(&RequestRecord, f64)> = records
        .iter()
        .filter_map(|r| r.duration_ms().map(|d| (*r, d as f64)))
        .collect();
    if timed.len() < 2 {
        return Vec::new();
    }

    let total: f64 = timed.iter().map(|(_, d)| d).sum();
    let others = (timed.len() - 1) as f64;

    timed
        .iter()
        .filter_map(|(record, duration)| {
            let baseline = (total - duration) / others;
            if baseline <= 0.0 || *duration <= baseline * SPIKE_FACTOR {
                return None;
            }

            let ratio = duration / baseline;
            Some(Anomaly {
                kind: AnomalyKind::Spike,
                severity: if ratio > SPIKE_HIGH_FACTOR {
                    Severity::High
                } else {
                    Severity::Medium
                },
                timestamp: record.timestamp,
                request_id: Some(record.request_id.clone()),
                value: *duration,
                baseline,
                description: format!(
                    "Response time {:.0}ms is {:.1}x the average of other requests ({:.0}ms)",
                    duration, ratio, baseline
                ),
            })
        })
        .collect()
}

fn detect_error_windows(records: &[&RequestRecord]) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let mut start = 0;

    while start + ERROR_WINDOW <= records.len() {
        let window = &records[start..start + ERROR_WINDOW];
        let errors = window.iter().filter(|r| r.is_error()).count();
        let rate = errors as f64 / ERROR_WINDOW as f64;

        if rate > ERROR_RATE_THRESHOLD {
            let last = window[ERROR_WINDOW - 1];
            anomalies.push(Anomaly {
                kind: AnomalyKind::ErrorRate,
                severity: if rate > ERROR_RATE_HIGH {
                    Severity::High
                } else {
                    Severity::Medium
                },
                timestamp: last.timestamp,
                request_id: Some(last.request_id.clone()),
                value: rate,
                baseline: ERROR_RATE_THRESHOLD,
                description: format!(
                    "{} of {} consecutive requests failed ({:.0}%)",
                    errors,
                    ERROR_WINDOW,
                    rate * 100.0
                ),
            });
            // Next window starts after this one
            start += ERROR_WINDOW;
        } else {
            start += 1;
        }
    }

    anomalies
}

fn detect_throughput_dips(records: &[RequestRecord]) -> Vec<Anomaly> {
    let series = time_series(records, TimeSeriesMetric::Throughput, THROUGHPUT_BUCKET);

    series
        .windows(2)
        .filter_map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            if prev.value <= 0.0 {
                return None;
            }

            let drop = (prev.value - cur.value) / prev.value;
            if drop <= THROUGHPUT_DROP {
                return None;
            }

            Some(Anomaly {
                kind: AnomalyKind::ThroughputDip,
                severity: if drop > THROUGHPUT_DROP_HIGH {
                    Severity::High
                } else {
                    Severity::Medium
                },
                timestamp: cur.timestamp,
                request_id: None,
                value: cur.value,
                baseline: prev.value,
                description: format!(
                    "Throughput fell {:.0}% ({} -> {} requests per minute)",
                    drop * 100.0,
                    prev.value,
                    cur.value
                ),
            })
        })
        .collect()
}
