//! Performance analysis over recorded traffic
//!
//! The analyzer reads records back from storage and turns them into an
//! `AnalysisReport`: aggregate metrics, anomalies, trends and plain-text
//! recommendations. Reports can be rendered with [`export`].

pub mod anomaly;
pub mod export;
pub mod stats;
pub mod trend;

pub use anomaly::{detect_anomalies, Anomaly, AnomalyKind, Severity};
pub use export::{export_to_file, render_replay_results, render_report, ExportFormat};
pub use stats::{calculate_percentiles, compute_metrics, percentile, PerformanceMetrics};
pub use trend::{analyze_trend, time_series, TimeSeriesMetric, TimeSeriesPoint, TrendAnalysis, TrendDirection};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AnalyzerConfig;
use crate::error::{DebugError, Result};
use crate::record::{current_millis, RequestRecord};
use crate::storage::{DebugStorage, RecordQuery};

/// What a report covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportScope {
    Records,
    Session { session_id: String },
    Port { port: u16, since: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub category: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub generated_at: u64,
    pub scope: ReportScope,
    pub metrics: PerformanceMetrics,
    pub anomalies: Vec<Anomaly>,
    pub trends: Vec<TrendAnalysis>,
    pub recommendations: Vec<Recommendation>,
}

pub struct PerformanceAnalyzer {
    config: AnalyzerConfig,
    storage: Arc<DebugStorage>,
}

impl PerformanceAnalyzer {
    pub fn new(config: AnalyzerConfig, storage: Arc<DebugStorage>) -> Self {
        Self { config, storage }
    }

    fn bucket(&self) -> Duration {
        Duration::from_secs(self.config.bucket_seconds.max(1))
    }

    pub fn analyze_records(&self, records: &[RequestRecord]) -> AnalysisReport {
        self.build_report(ReportScope::Records, records)
    }

    pub async fn analyze_session(&self, session_id: &str) -> Result<AnalysisReport> {
        let records = self
            .storage
            .find_records(&RecordQuery::for_session(session_id))
            .await?;
        if records.is_empty() {
            return Err(DebugError::NotFound(format!("records for session '{}'", session_id)));
        }

        Ok(self.build_report(
            ReportScope::Session {
                session_id: session_id.to_string(),
            },
            &records,
        ))
    }

    /// Analyze every record of a port, optionally only those since a time
    pub async fn analyze_port(&self, port: u16, since: Option<u64>) -> Result<AnalysisReport> {
        let query = RecordQuery {
            since,
            ..RecordQuery::for_port(port)
        };
        let records = self.storage.find_records(&query).await?;

        Ok(self.build_report(ReportScope::Port { port, since }, &records))
    }

    fn build_report(&self, scope: ReportScope, records: &[RequestRecord]) -> AnalysisReport {
        let metrics = compute_metrics(records);
        let trends = [
            TimeSeriesMetric::ResponseTime,
            TimeSeriesMetric::ErrorRate,
            TimeSeriesMetric::Throughput,
        ]
        .into_iter()
        .map(|metric| analyze_trend(&time_series(records, metric, self.bucket()), metric))
        .collect();

        let report = AnalysisReport {
            generated_at: current_millis(),
            scope,
            anomalies: detect_anomalies(records),
            trends,
            recommendations: self.recommendations(&metrics),
            metrics,
        };

        tracing::debug!(
            records = records.len(),
            anomalies = report.anomalies.len(),
            recommendations = report.recommendations.len(),
            "Analysis report built"
        );

        report
    }

    pub fn time_series(&self, records: &[RequestRecord], metric: TimeSeriesMetric) -> Vec<TimeSeriesPoint> {
        time_series(records, metric, self.bucket())
    }

    /// Threshold-based suggestions for a metrics snapshot
    pub fn recommendations(&self, metrics: &PerformanceMetrics) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if metrics.total_requests == 0 {
            return out;
        }

        if metrics.latency.avg > self.config.latency_threshold_ms {
            out.push(Recommendation {
                category: "latency".to_string(),
                severity: if metrics.latency.avg > self.config.latency_threshold_ms * 2.0 {
                    Severity::High
                } else {
                    Severity::Medium
                },
                message: format!(
                    "Average response time is {:.0}ms (threshold {:.0}ms); check provider latency and consider caching or a faster model",
                    metrics.latency.avg, self.config.latency_threshold_ms
                ),
            });
        }

        if metrics.error_rate > self.config.error_rate_threshold {
            out.push(Recommendation {
                category: "errors".to_string(),
                severity: if metrics.error_rate > self.config.error_rate_threshold * 4.0 {
                    Severity::High
                } else {
                    Severity::Medium
                },
                message: format!(
                    "Error rate is {:.1}% (threshold {:.1}%); inspect failed records and provider health",
                    metrics.error_rate * 100.0,
                    self.config.error_rate_threshold * 100.0
                ),
            });
        }

        for (module, stats) in &metrics.modules {
            if stats.avg_duration > self.config.module_latency_threshold_ms {
                out.push(Recommendation {
                    category: "module".to_string(),
                    severity: Severity::Medium,
                    message: format!(
                        "Layer '{}' averages {:.0}ms (threshold {:.0}ms)",
                        module, stats.avg_duration, self.config.module_latency_threshold_ms
                    ),
                });
            }
        }

        out
    }
}
