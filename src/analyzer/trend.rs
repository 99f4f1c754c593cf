//! Time-bucketed series and trend direction

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::record::RequestRecord;

/// A change smaller than this (in percent) is reported as stable
const STABLE_THRESHOLD_PERCENT: f64 = 10.0;

/// Upper bound on buckets in one series; wider spans get wider buckets
pub const MAX_BUCKETS: usize = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSeriesMetric {
    ResponseTime,
    Throughput,
    ErrorRate,
}

impl TimeSeriesMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSeriesMetric::ResponseTime => "response_time",
            TimeSeriesMetric::Throughput => "throughput",
            TimeSeriesMetric::ErrorRate => "error_rate",
        }
    }

    /// Whether a larger value is better
    fn higher_is_better(&self) -> bool {
        matches!(self, TimeSeriesMetric::Throughput)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    /// Bucket start (Unix milliseconds)
    pub timestamp: u64,
    pub value: f64,
    /// Records that fell into the bucket
    pub count: u64,
}

/// Bucket records into fixed-width, non-overlapping windows
///
/// Buckets run from the earliest to the latest record timestamp; buckets
/// without records report 0. When the span would need more than
/// [`MAX_BUCKETS`] buckets, the bucket width grows to fit.
pub fn time_series(records: &[RequestRecord], metric: TimeSeriesMetric, bucket: Duration) -> Vec<TimeSeriesPoint> {
    let (Some(first), Some(last)) = (
        records.iter().map(|r| r.timestamp).min(),
        records.iter().map(|r| r.timestamp).max(),
    ) else {
        return Vec::new();
    };

    let span = last - first;
    let requested = u64::try_from(bucket.as_millis()).unwrap_or(u64::MAX).max(1);
    let width = requested.max(span / (MAX_BUCKETS as u64 - 1) + 1);
    let bucket_count = (span / width + 1) as usize;

    // (records, errors, duration sum, duration samples)
    let mut acc = vec![(0u64, 0u64, 0f64, 0u64); bucket_count];
    for record in records {
        let slot = &mut acc[((record.timestamp - first) / width) as usize];
        slot.0 += 1;
        if record.is_error() {
            slot.1 += 1;
        }
        if let Some(duration) = record.duration_ms() {
            slot.2 += duration as f64;
            slot.3 += 1;
        }
    }

    acc.into_iter()
        .enumerate()
        .map(|(i, (count, errors, duration_sum, samples))| {
            let value = match metric {
                TimeSeriesMetric::ResponseTime if samples > 0 => duration_sum / samples as f64,
                TimeSeriesMetric::Throughput => count as f64,
                TimeSeriesMetric::ErrorRate if count > 0 => errors as f64 / count as f64,
                _ => 0.0,
            };
            TimeSeriesPoint {
                timestamp: first + i as u64 * width,
                value,
                count,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Degrading => "degrading",
            TrendDirection::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendAnalysis {
    pub metric: TimeSeriesMetric,
    pub direction: TrendDirection,
    pub change_percent: f64,
    pub first_half_mean: f64,
    pub second_half_mean: f64,
}

/// Compare the means of the two halves of a series
pub fn analyze_trend(series: &[TimeSeriesPoint], metric: TimeSeriesMetric) -> TrendAnalysis {
    if series.len() < 2 {
        let mean = mean(series);
        return TrendAnalysis {
            metric,
            direction: TrendDirection::Stable,
            change_percent: 0.0,
            first_half_mean: mean,
            second_half_mean: mean,
        };
    }

    let (first, second) = series.split_at(series.len() / 2);
    let first_half_mean = mean(first);
    let second_half_mean = mean(second);

    let change_percent = if first_half_mean == 0.0 {
        if second_half_mean == 0.0 {
            0.0
        } else {
            100.0
        }
    } else {
        (second_half_mean - first_half_mean) / first_half_mean * 100.0
    };

    let direction = if change_percent.abs() < STABLE_THRESHOLD_PERCENT {
        TrendDirection::Stable
    } else if (change_percent > 0.0) == metric.higher_is_better() {
        TrendDirection::Improving
    } else {
        TrendDirection::Degrading
    };

    TrendAnalysis {
        metric,
        direction,
        change_percent,
        first_half_mean,
        second_half_mean,
    }
}

fn mean(points: &[TimeSeriesPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64
}
