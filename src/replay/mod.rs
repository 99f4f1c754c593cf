//! Replay of recorded requests against a pipeline
//!
//! A stored record is turned into a `PipelineBlueprint`, a factory builds a
//! runnable pipeline from it, and the original request body is executed
//! again. The replayed outcome is diffed against the recorded response.
//!
//! ## Caching
//!
//! Results are cached by `(request_id, options)`. Failures are always
//! cached; successful comparisons are cached only when they pass
//! `validate_replay`. Nothing is evicted until `clear_cache`.

pub mod diff;
pub mod reconstruct;

pub use diff::{compare_outcomes, diff_values, DiffOptions, Difference, DifferenceKind, OutcomeDiff};
pub use reconstruct::{blueprint_from_record, DefaultPipelineFactory, RecordedPipeline};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ReplayConfig;
use crate::error::{DebugError, Result};
use crate::events::{DebugNotification, NotificationBus};
use crate::pipeline::{Pipeline, PipelineFactory, PipelineManager};
use crate::record::{current_millis, RecordedError, RequestRecord};
use crate::recorder::DebugRecorder;

/// Per-call replay options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOptions {
    /// Report a `timing` difference when durations diverge beyond tolerance
    #[serde(default)]
    pub compare_timing: bool,
    /// Overrides the configured numeric tolerance
    #[serde(default)]
    pub tolerance_percent: Option<f64>,
    /// Ignored in addition to the configured fields
    #[serde(default)]
    pub extra_ignore_fields: Vec<String>,
    /// Overrides the configured timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ReplayOptions {
    fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What the pipeline did when replayed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayedExecution {
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
    /// Milliseconds
    pub duration: u64,
    pub module_names: Vec<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceComparison {
    pub original_duration: u64,
    pub replay_duration: u64,
    /// replay / original
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub original: RequestRecord,
    pub replayed: ReplayedExecution,
    pub is_valid: bool,
    pub differences: Vec<Difference>,
    pub outcome: OutcomeDiff,
    pub performance: PerformanceComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFailure {
    pub request_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReplaySummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub failed: usize,
    pub results: Vec<ReplayResult>,
    pub failures: Vec<ReplayFailure>,
    pub duration_ms: u64,
}

#[derive(Clone)]
enum CachedReplay {
    Completed(ReplayResult),
    TimedOut(Duration),
    Failed(String),
}

impl CachedReplay {
    fn into_result(self, request_id: &str) -> Result<ReplayResult> {
        match self {
            CachedReplay::Completed(result) => Ok(result),
            CachedReplay::TimedOut(after) => Err(DebugError::Timeout {
                operation: format!("replay of {}", request_id),
                after,
            }),
            CachedReplay::Failed(message) => Err(DebugError::Replay {
                request_id: request_id.to_string(),
                message,
            }),
        }
    }
}

pub struct ReplayEngine {
    config: ReplayConfig,
    recorder: Arc<DebugRecorder>,
    factory: Arc<dyn PipelineFactory>,
    bus: NotificationBus,
    cache: DashMap<(String, String), CachedReplay>,
}

impl ReplayEngine {
    pub fn new(
        config: ReplayConfig,
        recorder: Arc<DebugRecorder>,
        factory: Arc<dyn PipelineFactory>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            config,
            recorder,
            factory,
            bus,
            cache: DashMap::new(),
        }
    }

    /// Engine using [`DefaultPipelineFactory`] over an optional live manager
    pub fn with_default_factory(
        config: ReplayConfig,
        recorder: Arc<DebugRecorder>,
        manager: Option<Arc<dyn PipelineManager>>,
        bus: NotificationBus,
    ) -> Self {
        Self::new(config, recorder, Arc::new(DefaultPipelineFactory::new(manager)), bus)
    }

    /// Replay one stored request
    pub async fn replay_request(&self, request_id: &str, options: &ReplayOptions) -> Result<ReplayResult> {
        let key = (request_id.to_string(), options.fingerprint());
        if let Some(cached) = self.cache.get(&key).map(|e| e.value().clone()) {
            tracing::debug!(request_id = request_id, "Replay served from cache");
            return cached.into_result(request_id);
        }

        let started = Instant::now();
        let outcome = self.run_replay(request_id, options).await;

        let (label, entry) = match &outcome {
            Ok(result) => {
                let label = if result.replayed.error.is_some() {
                    "failed"
                } else if result.is_valid {
                    "valid"
                } else {
                    "invalid"
                };
                let cacheable = result.replayed.error.is_some()
                    || self.validate_replay(&result.original, &result.replayed);
                (label, cacheable.then(|| CachedReplay::Completed(result.clone())))
            }
            Err(DebugError::Timeout { after, .. }) => ("timeout", Some(CachedReplay::TimedOut(*after))),
            Err(e) => ("error", Some(CachedReplay::Failed(e.to_string()))),
        };

        if let Some(entry) = entry {
            self.cache.insert(key, entry);
        }
        crate::metrics::record_replay(label, started.elapsed());

        match &outcome {
            Ok(result) => {
                tracing::info!(
                    request_id = request_id,
                    is_valid = result.is_valid,
                    differences = result.differences.len(),
                    ratio = result.performance.ratio,
                    "Replay completed"
                );
                self.bus.publish(DebugNotification::ReplayCompleted {
                    request_id: request_id.to_string(),
                    is_valid: result.is_valid,
                    difference_count: result.differences.len(),
                });
            }
            Err(e) => {
                tracing::warn!(request_id = request_id, error = %e, "Replay failed");
            }
        }

        outcome
    }

    async fn run_replay(&self, request_id: &str, options: &ReplayOptions) -> Result<ReplayResult> {
        let original = self
            .recorder
            .load_record(request_id)
            .await
            .map_err(|e| DebugError::for_replay(request_id, e))?;

        let blueprint = blueprint_from_record(&original);
        let pipeline = self
            .factory
            .build(&blueprint)
            .await
            .map_err(|e| DebugError::for_replay(request_id, format!("failed to build pipeline: {:#}", e)))?;

        let timeout = Duration::from_secs(options.timeout_seconds.unwrap_or(self.config.timeout_seconds));
        let started = Instant::now();
        let executed = self
            .execute_with_timeout(Arc::clone(&pipeline), original.request.body.clone(), timeout)
            .await
            .ok_or_else(|| DebugError::Timeout {
                operation: format!("replay of {}", request_id),
                after: timeout,
            })?;

        let (response, error) = match executed {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(RecordedError::from(&e))),
        };

        let replayed = ReplayedExecution {
            pipeline_id: pipeline.id().to_string(),
            response,
            error,
            duration: started.elapsed().as_millis() as u64,
            module_names: pipeline.module_names(),
            timestamp: current_millis(),
        };

        Ok(self.compare(original, replayed, options))
    }

    /// Race the pipeline call against `timeout`
    ///
    /// Returns `None` on timeout. Unless `abort_on_timeout` is set the call
    /// keeps running detached and its result is discarded.
    async fn execute_with_timeout(
        &self,
        pipeline: Arc<dyn Pipeline>,
        request: Value,
        timeout: Duration,
    ) -> Option<anyhow::Result<Value>> {
        if self.config.abort_on_timeout {
            return tokio::time::timeout(timeout, pipeline.execute(request)).await.ok();
        }

        let handle = tokio::spawn(async move { pipeline.execute(request).await });
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(join_error)) => Some(Err(anyhow::anyhow!("replay task failed: {}", join_error))),
            Err(_) => None,
        }
    }

    fn compare(&self, original: RequestRecord, replayed: ReplayedExecution, options: &ReplayOptions) -> ReplayResult {
        let tolerance = options.tolerance_percent.unwrap_or(self.config.tolerance_percent);
        let mut ignore_fields = self.config.ignore_fields.clone();
        ignore_fields.extend(options.extra_ignore_fields.iter().cloned());
        let diff_options = DiffOptions {
            ignore_fields,
            tolerance_percent: tolerance,
        };

        let mut differences = Vec::new();

        if original.is_error() != replayed.error.is_some() {
            differences.push(Difference {
                path: "error".to_string(),
                original_value: original.error.as_ref().and_then(|e| serde_json::to_value(e).ok()),
                replayed_value: replayed.error.as_ref().and_then(|e| serde_json::to_value(e).ok()),
                kind: DifferenceKind::Error,
            });
        }

        if let (Some(original_response), Some(replayed_body)) = (&original.response, &replayed.response) {
            differences.extend(diff_values(&original_response.body, replayed_body, &diff_options));
        }

        let original_duration = original.duration_ms().unwrap_or(0);
        let ratio = replayed.duration as f64 / original_duration.max(1) as f64;
        if options.compare_timing
            && !diff::within_tolerance(original_duration as f64, replayed.duration as f64, tolerance)
        {
            differences.push(Difference {
                path: "duration".to_string(),
                original_value: Some(Value::from(original_duration)),
                replayed_value: Some(Value::from(replayed.duration)),
                kind: DifferenceKind::Timing,
            });
        }

        let is_valid = self.validate_replay(&original, &replayed)
            && differences.iter().all(|d| d.kind == DifferenceKind::Timing);

        ReplayResult {
            outcome: compare_outcomes(&original, &replayed),
            performance: PerformanceComparison {
                original_duration,
                replay_duration: replayed.duration,
                ratio,
            },
            original,
            replayed,
            is_valid,
            differences,
        }
    }

    /// Coarse acceptance check of a replay against its original
    ///
    /// - both succeeded or both failed
    /// - response bodies have the same top-level keys
    /// - configured key fields present in the original are equal in the replay
    /// - the layer sequence matches (when the original recorded one)
    pub fn validate_replay(&self, original: &RequestRecord, replayed: &ReplayedExecution) -> bool {
        let original_failed = original.is_error();
        if original_failed != replayed.error.is_some() {
            return false;
        }

        if !original_failed {
            let original_body = original.response.as_ref().map(|r| &r.body);
            match (original_body, replayed.response.as_ref()) {
                (Some(Value::Object(a)), Some(Value::Object(b))) => {
                    if a.len() != b.len() || !a.keys().all(|k| b.contains_key(k)) {
                        return false;
                    }
                    let key_fields_match = self
                        .config
                        .key_fields
                        .iter()
                        .filter_map(|field| a.get(field).map(|v| (field, v)))
                        .all(|(field, v)| b.get(field) == Some(v));
                    if !key_fields_match {
                        return false;
                    }
                }
                (Some(a), Some(b)) => {
                    if std::mem::discriminant(a) != std::mem::discriminant(b) {
                        return false;
                    }
                }
                _ => return false,
            }
        }

        let original_modules = dedup_consecutive(original.pipeline.module_names());
        original_modules.is_empty()
            || original_modules
                == dedup_consecutive(replayed.module_names.iter().map(String::as_str).collect())
    }

    /// Replay many requests in fixed-size concurrent groups
    ///
    /// Each group runs concurrently and the whole group is awaited before the
    /// next starts. Individual failures are collected, never fatal.
    pub async fn batch_replay(&self, request_ids: &[String], options: &ReplayOptions) -> BatchReplaySummary {
        let started = Instant::now();
        let group_size = self.config.concurrency.max(1);
        let mut summary = BatchReplaySummary {
            total: request_ids.len(),
            ..BatchReplaySummary::default()
        };

        for group in request_ids.chunks(group_size) {
            let outcomes =
                futures::future::join_all(group.iter().map(|id| self.replay_request(id, options))).await;

            for (id, outcome) in group.iter().zip(outcomes) {
                match outcome {
                    Ok(result) => {
                        if result.is_valid {
                            summary.valid += 1;
                        } else {
                            summary.invalid += 1;
                        }
                        summary.results.push(result);
                    }
                    Err(e) => {
                        summary.failed += 1;
                        summary.failures.push(ReplayFailure {
                            request_id: id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            total = summary.total,
            valid = summary.valid,
            invalid = summary.invalid,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Batch replay completed"
        );
        summary
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

fn dedup_consecutive(mut names: Vec<&str>) -> Vec<&str> {
    names.dedup();
    names
}
