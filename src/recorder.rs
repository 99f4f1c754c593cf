//! Per-request recording
//!
//! The recorder sits on the request path. It accumulates a partial
//! `RequestRecord` per in-flight request plus per-layer `ModuleRecord`s, and
//! persists the assembled record once a response or error arrives.
//!
//! None of the `record_*` methods return errors: anything that goes wrong is
//! logged and the data is dropped, so recording can never fail a request.
//!
//! A request id is accepted once per session. Sessions with no recording
//! activity for the configured idle timeout are ended by a background sweep.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::collector::EventCollector;
use crate::config::{PendingFlushPolicy, RecorderConfig};
use crate::error::{DebugError, Result};
use crate::events::{DebugNotification, NotificationBus};
use crate::filter::SensitiveDataFilter;
use crate::record::{
    current_millis, DebugSession, ModuleRecord, PipelineTrace, RecordedError, RequestRecord,
    RequestSnapshot, ResponseSnapshot,
};
use crate::storage::{DebugStorage, RecordQuery};
use crate::task::{shutdown_requested, BackgroundTask};

/// Module record tagged with its global insertion sequence
struct SequencedModule {
    seq: u64,
    record: ModuleRecord,
}

#[derive(Default)]
struct PendingState {
    /// requestId -> partial record
    records: HashMap<String, RequestRecord>,
    /// moduleName -> requestId -> module touches in call order
    modules: HashMap<String, HashMap<String, Vec<SequencedModule>>>,
    /// sessionId -> every request id accepted so far, persisted or not
    seen: HashMap<String, HashSet<String>>,
    next_seq: u64,
}

impl PendingState {
    /// Remove and return a request's module records in insertion order
    fn take_modules(&mut self, request_id: &str) -> Vec<ModuleRecord> {
        let mut collected = Vec::new();
        for per_request in self.modules.values_mut() {
            if let Some(entries) = per_request.remove(request_id) {
                collected.extend(entries);
            }
        }
        self.modules.retain(|_, per_request| !per_request.is_empty());

        collected.sort_by_key(|m| m.seq);
        collected.into_iter().map(|m| m.record).collect()
    }

    /// Most recent still-open touch of `module_name` for `request_id`
    fn open_module(&mut self, module_name: &str, request_id: &str) -> Option<&mut ModuleRecord> {
        self.modules
            .get_mut(module_name)?
            .get_mut(request_id)?
            .iter_mut()
            .rev()
            .map(|m| &mut m.record)
            .find(|m| m.is_open())
    }
}

pub struct DebugRecorder {
    config: RecorderConfig,
    filter: Arc<SensitiveDataFilter>,
    storage: Arc<DebugStorage>,
    collector: Arc<EventCollector>,
    bus: NotificationBus,
    sessions: DashMap<String, DebugSession>,
    /// sessionId -> last recording activity
    activity: DashMap<String, Instant>,
    pending: Mutex<PendingState>,
}

impl DebugRecorder {
    pub fn new(
        config: RecorderConfig,
        filter: Arc<SensitiveDataFilter>,
        storage: Arc<DebugStorage>,
        collector: Arc<EventCollector>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            config,
            filter,
            storage,
            collector,
            bus,
            sessions: DashMap::new(),
            activity: DashMap::new(),
            pending: Mutex::new(PendingState::default()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self, session_id: &str) {
        if self.sessions.contains_key(session_id) {
            self.activity.insert(session_id.to_string(), Instant::now());
        }
    }

    pub fn storage(&self) -> &Arc<DebugStorage> {
        &self.storage
    }

    pub fn collector(&self) -> &Arc<EventCollector> {
        &self.collector
    }

    // ============================================================
    // Sessions
    // ============================================================

    /// Open a recording session for a port
    pub async fn create_session(&self, port: u16, metadata: Value) -> Result<DebugSession> {
        let session_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let session = DebugSession::new(session_id, port, self.filter.filter_value(&metadata));

        self.storage.save_session(&session).await?;
        self.sessions.insert(session.session_id.clone(), session.clone());
        self.activity.insert(session.session_id.clone(), Instant::now());

        self.collector
            .collect_session_start(&session.session_id, port, session.metadata.clone());
        self.bus.publish(DebugNotification::SessionCreated {
            session_id: session.session_id.clone(),
            port,
        });

        tracing::info!(session_id = %session.session_id, port = port, "Debug session created");
        Ok(session)
    }

    /// Close a session: flush pending records, stamp `endTime`, persist
    pub async fn end_session(&self, session_id: &str) -> Result<DebugSession> {
        if !self.sessions.contains_key(session_id) {
            return Err(DebugError::NotFound(format!("active session '{}'", session_id)));
        }

        self.flush_pending(Some(session_id)).await;

        let (_, mut session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| DebugError::NotFound(format!("active session '{}'", session_id)))?;
        session.end_time = Some(current_millis().max(session.start_time));
        self.activity.remove(session_id);
        self.pending().seen.remove(session_id);

        self.storage.save_session(&session).await?;

        self.collector.collect_session_end(
            session_id,
            serde_json::json!({
                "requestCount": session.request_count,
                "errorCount": session.error_count,
                "durationMs": session.duration_ms(),
            }),
        );
        self.bus.publish(DebugNotification::SessionEnded {
            session_id: session.session_id.clone(),
            port: session.port,
            request_count: session.request_count,
            error_count: session.error_count,
        });

        tracing::info!(
            session_id = %session.session_id,
            requests = session.request_count,
            errors = session.error_count,
            "Debug session ended"
        );
        Ok(session)
    }

    /// End every session idle for at least `idle_timeout`
    pub async fn end_idle_sessions(&self, idle_timeout: Duration) -> Vec<DebugSession> {
        let now = Instant::now();
        let idle: Vec<String> = self
            .activity
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut ended = Vec::with_capacity(idle.len());
        for session_id in idle {
            match self.end_session(&session_id).await {
                Ok(session) => {
                    tracing::info!(
                        session_id = %session.session_id,
                        idle_secs = idle_timeout.as_secs(),
                        "Idle debug session ended"
                    );
                    ended.push(session);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to end idle session");
                }
            }
        }
        ended
    }

    pub fn active_sessions(&self) -> Vec<DebugSession> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }

    pub fn session(&self, session_id: &str) -> Option<DebugSession> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Active session for a port, if one is open
    pub fn session_for_port(&self, port: u16) -> Option<DebugSession> {
        self.sessions
            .iter()
            .find(|s| s.port == port)
            .map(|s| s.value().clone())
    }

    pub fn set_active_pipelines(&self, session_id: &str, pipeline_ids: Vec<String>) {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => session.active_pipeline_ids = pipeline_ids,
            None => tracing::warn!(session_id = session_id, "Cannot set pipelines on unknown session"),
        }
    }

    // ============================================================
    // Recording
    // ============================================================

    /// Start a record for a new request
    pub fn record_request(
        &self,
        session_id: &str,
        request_id: &str,
        request: RequestSnapshot,
        pipeline: PipelineTrace,
    ) {
        let Some(port) = self.sessions.get(session_id).map(|s| s.port) else {
            tracing::warn!(
                session_id = session_id,
                request_id = request_id,
                "Request for unknown session dropped"
            );
            return;
        };

        {
            let mut pending = self.pending();
            let accepted = !pending.records.contains_key(request_id)
                && pending
                    .seen
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(request_id.to_string());
            if !accepted {
                drop(pending);
                tracing::warn!(
                    session_id = session_id,
                    request_id = request_id,
                    "Duplicate request id dropped"
                );
                crate::metrics::record_dropped("duplicate");
                return;
            }
        }

        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.request_count += 1;
        }
        self.touch(session_id);

        let request = RequestSnapshot {
            method: request.method,
            url: self.filter.filter_text(&request.url),
            headers: self.filter.filter_headers(&request.headers),
            body: self.filter.filter_value(&request.body),
        };
        self.collector.collect_request(session_id, request_id, &request);

        let record = RequestRecord {
            request_id: request_id.to_string(),
            timestamp: current_millis(),
            port,
            session_id: session_id.to_string(),
            request,
            response: None,
            error: None,
            pipeline: PipelineTrace {
                modules: Vec::new(),
                ..pipeline
            },
        };

        self.pending().records.insert(request_id.to_string(), record);
    }

    pub fn record_module_input(&self, request_id: &str, module_name: &str, input: &Value, metadata: Value) {
        let input = self.filter.filter_value(input);
        let metadata = self.filter.filter_value(&metadata);

        let session_id = {
            let mut pending = self.pending();
            let Some(session_id) = pending.records.get(request_id).map(|r| r.session_id.clone()) else {
                drop(pending);
                tracing::warn!(
                    request_id = request_id,
                    module = module_name,
                    "Module input for unknown request dropped"
                );
                return;
            };

            let seq = pending.next_seq;
            pending.next_seq += 1;
            pending
                .modules
                .entry(module_name.to_string())
                .or_default()
                .entry(request_id.to_string())
                .or_default()
                .push(SequencedModule {
                    seq,
                    record: ModuleRecord::open(module_name, input.clone(), metadata),
                });
            session_id
        };

        self.touch(&session_id);
        self.collector
            .collect_module_input(&session_id, request_id, module_name, &input);
    }

    pub fn record_module_output(&self, request_id: &str, module_name: &str, output: &Value) {
        let output = self.filter.filter_value(output);

        let session_id = {
            let mut pending = self.pending();
            let session_id = pending.records.get(request_id).map(|r| r.session_id.clone());
            match (session_id, pending.open_module(module_name, request_id)) {
                (Some(session_id), Some(module)) => {
                    module.output = Some(output.clone());
                    module.close(current_millis());
                    session_id
                }
                _ => {
                    tracing::warn!(
                        request_id = request_id,
                        module = module_name,
                        "Module output without matching input dropped"
                    );
                    return;
                }
            }
        };

        self.touch(&session_id);
        self.collector
            .collect_module_output(&session_id, request_id, module_name, &output);
    }

    pub fn record_module_error(&self, request_id: &str, module_name: &str, error: &RecordedError) {
        let error = self.filter.filter_error(error);

        let session_id = {
            let mut pending = self.pending();
            let session_id = pending.records.get(request_id).map(|r| r.session_id.clone());
            match (session_id, pending.open_module(module_name, request_id)) {
                (Some(session_id), Some(module)) => {
                    module.error = Some(error.clone());
                    module.close(current_millis());
                    session_id
                }
                _ => {
                    tracing::warn!(
                        request_id = request_id,
                        module = module_name,
                        "Module error without matching input dropped"
                    );
                    return;
                }
            }
        };

        self.touch(&session_id);
        self.collector
            .collect_module_error(&session_id, request_id, module_name, &error);
    }

    /// Complete a request with its response and persist the record
    pub async fn record_response(&self, request_id: &str, response: ResponseSnapshot) {
        let response = ResponseSnapshot {
            status: response.status,
            headers: self.filter.filter_headers(&response.headers),
            body: self.filter.filter_value(&response.body),
            duration: response.duration,
        };

        let Some(mut record) = self.take_pending(request_id) else {
            tracing::warn!(request_id = request_id, "Response for unknown request dropped");
            return;
        };

        self.collector
            .collect_response(&record.session_id, request_id, &response);
        record.response = Some(response);
        self.persist(record).await;
    }

    /// Complete a request with an error and persist the record
    pub async fn record_error(&self, request_id: &str, error: &RecordedError) {
        let error = self.filter.filter_error(error);

        let Some(mut record) = self.take_pending(request_id) else {
            tracing::warn!(request_id = request_id, "Error for unknown request dropped");
            return;
        };

        self.collector
            .collect_error(&record.session_id, Some(request_id), &error);
        record.error = Some(error);
        self.persist(record).await;
    }

    fn take_pending(&self, request_id: &str) -> Option<RequestRecord> {
        let mut pending = self.pending();
        let mut record = pending.records.remove(request_id)?;
        record.pipeline.modules = pending.take_modules(request_id);
        drop(pending);

        self.touch(&record.session_id);
        Some(record)
    }

    async fn persist(&self, record: RequestRecord) {
        if record.is_error() {
            if let Some(mut session) = self.sessions.get_mut(&record.session_id) {
                session.error_count += 1;
            }
        }

        match self.storage.save_record(&record).await {
            Ok(_) => {
                crate::metrics::record_saved(record.port);
                self.bus.publish(DebugNotification::RecordSaved {
                    request_id: record.request_id,
                    session_id: record.session_id,
                    port: record.port,
                });
            }
            Err(e) => {
                tracing::error!(
                    request_id = %record.request_id,
                    session_id = %record.session_id,
                    error = %e,
                    "Failed to persist debug record"
                );
                crate::metrics::record_storage_error("save_record");
                if matches!(e, DebugError::SizeLimitExceeded { .. }) {
                    crate::metrics::record_dropped("size_limit");
                }
                self.bus.publish(DebugNotification::StorageError {
                    operation: "save_record".to_string(),
                    message: format!("request {}: {}", record.request_id, e),
                });
            }
        }
    }

    /// Force out pending records (all sessions, or one)
    ///
    /// Returns how many records were persisted; the rest are dropped
    /// according to the pending-flush policy.
    pub async fn flush_pending(&self, session_id: Option<&str>) -> usize {
        let records: Vec<RequestRecord> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .records
                .values()
                .filter(|r| session_id.map_or(true, |s| r.session_id == s))
                .map(|r| r.request_id.clone())
                .collect();

            ids.iter()
                .filter_map(|id| {
                    let mut record = pending.records.remove(id)?;
                    record.pipeline.modules = pending.take_modules(id);
                    Some(record)
                })
                .collect()
        };

        let mut persisted = 0;
        for record in records {
            let keep = match self.config.pending_flush_policy {
                PendingFlushPolicy::CompleteOnly => record.is_complete(),
                PendingFlushPolicy::All => true,
            };

            if keep {
                self.persist(record).await;
                persisted += 1;
            } else {
                tracing::debug!(request_id = %record.request_id, "Dropping incomplete pending record");
                crate::metrics::record_dropped("incomplete");
                self.bus.publish(DebugNotification::RecordDropped {
                    request_id: record.request_id,
                    reason: "incomplete".to_string(),
                });
            }
        }

        persisted
    }

    pub fn pending_count(&self) -> usize {
        self.pending().records.len()
    }

    // ============================================================
    // Queries
    // ============================================================

    pub async fn load_record(&self, request_id: &str) -> Result<RequestRecord> {
        self.storage.load_record(request_id).await
    }

    pub async fn find_records(&self, query: &RecordQuery) -> Result<Vec<RequestRecord>> {
        self.storage.find_records(query).await
    }

    pub async fn session_records(&self, session_id: &str) -> Result<Vec<RequestRecord>> {
        self.storage.find_records(&RecordQuery::for_session(session_id)).await
    }
}

/// Spawn the idle-session sweep
///
/// Every `interval`, ends sessions with no recording activity for
/// `idle_timeout` until the returned handle is stopped.
pub fn spawn_idle_session_task(
    recorder: Arc<DebugRecorder>,
    idle_timeout: Duration,
    interval: Duration,
) -> BackgroundTask {
    BackgroundTask::spawn("idle-sessions", move |mut shutdown| async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ended = recorder.end_idle_sessions(idle_timeout).await;
                    if !ended.is_empty() {
                        tracing::debug!(sessions_ended = ended.len(), "Idle session sweep completed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectorConfig, FilterConfig, StorageConfig};
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_recorder(policy: PendingFlushPolicy) -> (TempDir, DebugRecorder) {
        create_test_recorder_with_limit(policy, StorageConfig::default().max_record_size_bytes).await
    }

    async fn create_test_recorder_with_limit(
        policy: PendingFlushPolicy,
        max_record_size_bytes: usize,
    ) -> (TempDir, DebugRecorder) {
        let dir = TempDir::new().unwrap();
        let bus = NotificationBus::default();
        let filter = Arc::new(SensitiveDataFilter::new(&FilterConfig::default()).unwrap());
        let storage_config = StorageConfig {
            base_dir: dir.path().to_path_buf(),
            compression: false,
            max_record_size_bytes,
            ..StorageConfig::default()
        };
        let storage = Arc::new(DebugStorage::new(&storage_config, bus.clone()).await.unwrap());
        let collector = Arc::new(EventCollector::new(
            CollectorConfig {
                auto_flush: false,
                ..CollectorConfig::default()
            },
            filter.clone(),
            bus.clone(),
        ));
        let recorder = DebugRecorder::new(
            RecorderConfig {
                pending_flush_policy: policy,
                ..RecorderConfig::default()
            },
            filter,
            storage,
            collector,
            bus,
        );
        (dir, recorder)
    }

    fn request_with_secret() -> RequestSnapshot {
        let mut request = RequestSnapshot::new(
            "POST",
            "/v1/chat/completions",
            json!({"model": "gpt-4", "api_key": "plain-secret"}),
        );
        request
            .headers
            .insert("Authorization".to_string(), "Bearer abc.def.ghi".to_string());
        request
    }

    #[tokio::test]
    async fn test_full_request_is_persisted_filtered_and_ordered() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        let session = recorder.create_session(8080, json!({})).await.unwrap();
        let sid = session.session_id.as_str();

        recorder.record_request(sid, "req-1", request_with_secret(), PipelineTrace::new("p1", "openai", "gpt-4"));
        recorder.record_module_input("req-1", "transformer", &json!({"a": 1}), json!({}));
        recorder.record_module_input("req-1", "protocol", &json!({"b": 2}), json!({}));
        recorder.record_module_output("req-1", "protocol", &json!({"token": "t"}));
        recorder.record_module_output("req-1", "transformer", &json!({"ok": true}));
        recorder
            .record_response("req-1", ResponseSnapshot::new(200, json!({"id": "x"}), 42))
            .await;

        let record = recorder.load_record("req-1").await.unwrap();
        assert_eq!(record.pipeline.module_names(), vec!["transformer", "protocol"]);
        assert_eq!(record.request.headers["Authorization"], "[REDACTED]");
        assert_eq!(record.request.body["api_key"], "[REDACTED]");
        assert_eq!(record.pipeline.modules[1].output, Some(json!({"token": "[REDACTED]"})));
        assert!(record.pipeline.modules.iter().all(|m| m.duration.is_some()));
        assert_eq!(recorder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_output_is_dropped() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        let session = recorder.create_session(8080, json!({})).await.unwrap();

        recorder.record_request(
            &session.session_id,
            "req-1",
            RequestSnapshot::new("POST", "/", json!({})),
            PipelineTrace::new("p1", "openai", "gpt-4"),
        );
        // Output without a preceding input
        recorder.record_module_output("req-1", "server", &json!({}));
        recorder.record_module_output("unknown", "server", &json!({}));
        recorder
            .record_error("req-1", &RecordedError::new("upstream failed"))
            .await;

        let record = recorder.load_record("req-1").await.unwrap();
        assert!(record.pipeline.modules.is_empty());
        assert!(record.is_error());
        assert_eq!(recorder.session(&session.session_id).unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_ignored() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        recorder.record_request(
            "missing",
            "req-1",
            RequestSnapshot::new("GET", "/", json!({})),
            PipelineTrace::default(),
        );
        assert_eq!(recorder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_end_session_drops_incomplete_records() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        let mut rx = recorder.bus.subscribe();
        let session = recorder.create_session(8080, json!({})).await.unwrap();
        let sid = session.session_id.clone();

        recorder.record_request(&sid, "done", RequestSnapshot::new("POST", "/", json!({})), PipelineTrace::default());
        recorder
            .record_response("done", ResponseSnapshot::new(200, json!({}), 5))
            .await;
        recorder.record_request(&sid, "hanging", RequestSnapshot::new("POST", "/", json!({})), PipelineTrace::default());

        let ended = recorder.end_session(&sid).await.unwrap();
        assert_eq!(ended.request_count, 2);
        assert!(ended.end_time.is_some());
        assert!(recorder.session(&sid).is_none());
        assert!(recorder.load_record("hanging").await.is_err());

        let stored = recorder.storage().load_session(8080, &sid).await.unwrap();
        assert_eq!(stored.end_time, ended.end_time);

        let mut saw_dropped = false;
        let mut saw_ended = false;
        while let Ok(n) = rx.try_recv() {
            match n {
                DebugNotification::RecordDropped { request_id, .. } => saw_dropped = request_id == "hanging",
                DebugNotification::SessionEnded { request_count, .. } => saw_ended = request_count == 2,
                _ => {}
            }
        }
        assert!(saw_dropped && saw_ended);
    }

    #[tokio::test]
    async fn test_flush_all_policy_persists_incomplete() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::All).await;
        let session = recorder.create_session(9000, json!({})).await.unwrap();

        recorder.record_request(
            &session.session_id,
            "partial",
            RequestSnapshot::new("POST", "/", json!({})),
            PipelineTrace::default(),
        );
        recorder.record_module_input("partial", "transformer", &json!({}), json!({}));

        assert_eq!(recorder.flush_pending(None).await, 1);
        let record = recorder.load_record("partial").await.unwrap();
        assert!(!record.is_complete());
        assert_eq!(record.pipeline.modules.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_record_emits_storage_error() {
        let (_dir, recorder) = create_test_recorder_with_limit(PendingFlushPolicy::CompleteOnly, 1024).await;
        let session = recorder.create_session(8080, json!({})).await.unwrap();
        let mut rx = recorder.bus.subscribe();

        recorder.record_request(
            &session.session_id,
            "huge",
            RequestSnapshot::new("POST", "/", json!({})),
            PipelineTrace::default(),
        );
        let body = "lorem ipsum ".repeat(1000);
        recorder
            .record_response("huge", ResponseSnapshot::new(200, json!({ "text": body }), 1))
            .await;

        let mut saw_error = false;
        while let Ok(n) = rx.try_recv() {
            if let DebugNotification::StorageError { operation, .. } = n {
                saw_error = operation == "save_record";
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_request_id_accepted_once_per_session() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        let session = recorder.create_session(8080, json!({})).await.unwrap();
        let sid = session.session_id.as_str();
        let request = |body| RequestSnapshot::new("POST", "/", body);

        recorder.record_request(sid, "dup", request(json!({"first": true})), PipelineTrace::default());
        // Duplicate while the first is still pending
        recorder.record_request(sid, "dup", request(json!({"pending": true})), PipelineTrace::default());
        assert_eq!(recorder.session(sid).unwrap().request_count, 1);
        assert_eq!(recorder.collector().statistics().events_by_type["request"], 1);

        recorder
            .record_response("dup", ResponseSnapshot::new(200, json!({}), 5))
            .await;

        // Duplicate after the first was persisted
        recorder.record_request(sid, "dup", request(json!({"second": true})), PipelineTrace::default());
        recorder
            .record_response("dup", ResponseSnapshot::new(200, json!({}), 5))
            .await;

        let record = recorder.load_record("dup").await.unwrap();
        assert_eq!(record.request.body, json!({"first": true}));
        assert_eq!(recorder.session(sid).unwrap().request_count, 1);
        assert_eq!(recorder.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_ended() {
        let (_dir, recorder) = create_test_recorder(PendingFlushPolicy::CompleteOnly).await;
        let recorder = Arc::new(recorder);
        let idle = recorder.create_session(8081, json!({})).await.unwrap();
        let busy = recorder.create_session(8080, json!({})).await.unwrap();

        recorder.record_request(
            &idle.session_id,
            "stale",
            RequestSnapshot::new("POST", "/", json!({})),
            PipelineTrace::default(),
        );
        time::advance(Duration::from_secs(20)).await;
        recorder.record_request(
            &busy.session_id,
            "fresh",
            RequestSnapshot::new("POST", "/", json!({})),
            PipelineTrace::default(),
        );

        let task = spawn_idle_session_task(recorder.clone(), Duration::from_secs(30), Duration::from_secs(5));
        time::sleep(Duration::from_secs(16)).await;
        task.stop().await;

        assert!(recorder.session(&idle.session_id).is_none());
        assert!(recorder.session(&busy.session_id).is_some());
        assert_eq!(recorder.pending_count(), 1);

        let stored = recorder.storage().load_session(8081, &idle.session_id).await.unwrap();
        assert!(stored.end_time.is_some());
        assert_eq!(stored.request_count, 1);
    }
}
