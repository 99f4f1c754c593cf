//! Aggregate performance metrics over request records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::RequestRecord;

/// Percentile of raw samples using linear interpolation
///
/// # Algorithm
/// 1. Sort ascending
/// 2. `index = p * (n - 1)`
/// 3. Interpolate between the samples either side of `index`
///
/// Returns `None` for an empty slice. `p` is clamped to `[0, 1]`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let index = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    let fraction = index - lower as f64;

    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

/// P50, P95 and P99 of a sample set
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

pub fn calculate_percentiles(values: &[f64]) -> Percentiles {
    Percentiles {
        p50: percentile(values, 0.50).unwrap_or(0.0),
        p95: percentile(values, 0.95).unwrap_or(0.0),
        p99: percentile(values, 0.99).unwrap_or(0.0),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    #[serde(flatten)]
    pub percentiles: Percentiles,
}

impl LatencyStats {
    pub fn from_samples(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        Self {
            avg: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            percentiles: calculate_percentiles(values),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStats {
    pub count: u64,
    pub error_count: u64,
    pub avg_duration: f64,
    pub max_duration: f64,
    pub p95_duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Response durations in milliseconds
    pub latency: LatencyStats,
    /// Requests per second over the covered time range
    pub throughput: f64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub modules: BTreeMap<String, ModuleStats>,
    pub providers: BTreeMap<String, u64>,
}

/// Compute aggregate metrics for a set of records
pub fn compute_metrics(records: &[RequestRecord]) -> PerformanceMetrics {
    if records.is_empty() {
        return PerformanceMetrics::default();
    }

    let total = records.len() as u64;
    let failed = records.iter().filter(|r| r.is_error()).count() as u64;

    let durations: Vec<f64> = records
        .iter()
        .filter_map(|r| r.duration_ms())
        .map(|d| d as f64)
        .collect();

    let start_time = records.iter().map(|r| r.timestamp).min();
    let end_time = records.iter().map(|r| r.timestamp).max();
    let span_ms = match (start_time, end_time) {
        (Some(start), Some(end)) => (end - start).max(1000),
        _ => 1000,
    };

    let mut module_samples: BTreeMap<String, (Vec<f64>, u64)> = BTreeMap::new();
    let mut providers: BTreeMap<String, u64> = BTreeMap::new();

    for record in records {
        if !record.pipeline.provider.is_empty() {
            *providers.entry(record.pipeline.provider.clone()).or_insert(0) += 1;
        }
        for module in &record.pipeline.modules {
            let entry = module_samples.entry(module.module_name.clone()).or_default();
            if let Some(duration) = module.duration {
                entry.0.push(duration as f64);
            }
            if module.error.is_some() {
                entry.1 += 1;
            }
        }
    }

    let modules = module_samples
        .into_iter()
        .map(|(name, (samples, errors))| {
            let latency = LatencyStats::from_samples(&samples);
            let stats = ModuleStats {
                count: samples.len() as u64,
                error_count: errors,
                avg_duration: latency.avg,
                max_duration: latency.max,
                p95_duration: latency.percentiles.p95,
            };
            (name, stats)
        })
        .collect();

    PerformanceMetrics {
        total_requests: total,
        successful_requests: total - failed,
        failed_requests: failed,
        success_rate: (total - failed) as f64 / total as f64,
        error_rate: failed as f64 / total as f64,
        latency: LatencyStats::from_samples(&durations),
        throughput: total as f64 / (span_ms as f64 / 1000.0),
        start_time,
        end_time,
        modules,
        providers,
    }
}
