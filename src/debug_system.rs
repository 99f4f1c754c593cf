//! Wiring for the whole debug subsystem
//!
//! Builds every component from one `DebugConfig`, shares a single
//! notification bus between them, and owns the background tasks.

use std::sync::{Arc, Mutex};

use crate::analyzer::PerformanceAnalyzer;
use crate::collector::EventCollector;
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use crate::events::NotificationBus;
use crate::filter::SensitiveDataFilter;
use crate::pipeline::{PipelineFactory, PipelineManager, PipelineRouter, PipelineSelector, RoutingTable};
use crate::recorder::{spawn_idle_session_task, DebugRecorder};
use crate::replay::{DefaultPipelineFactory, ReplayEngine};
use crate::storage::{run_cleanup_now, spawn_cleanup_task, DebugStorage, RetentionConfig};
use crate::task::BackgroundTask;
use crate::validator::{PipelineValidator, RequestFlowDiagnostic, ValidationReport};

pub struct DebugSystem {
    config: DebugConfig,
    bus: NotificationBus,
    storage: Arc<DebugStorage>,
    collector: Arc<EventCollector>,
    recorder: Arc<DebugRecorder>,
    analyzer: PerformanceAnalyzer,
    replay: ReplayEngine,
    validator: PipelineValidator,
    manager: Option<Arc<dyn PipelineManager>>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl DebugSystem {
    /// Build all components; the storage root is created if missing
    ///
    /// `manager` is the live pipeline inventory. Without it replay runs
    /// offline against recorded outcomes and validation is unavailable.
    pub async fn new(
        config: DebugConfig,
        routing: RoutingTable,
        manager: Option<Arc<dyn PipelineManager>>,
    ) -> Result<Self> {
        let factory: Arc<dyn PipelineFactory> = Arc::new(DefaultPipelineFactory::new(manager.clone()));
        Self::with_factory(config, routing, manager, factory).await
    }

    /// Like [`DebugSystem::new`] with a custom replay pipeline factory
    pub async fn with_factory(
        config: DebugConfig,
        routing: RoutingTable,
        manager: Option<Arc<dyn PipelineManager>>,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self> {
        let bus = NotificationBus::default();
        let filter = Arc::new(SensitiveDataFilter::new(&config.filter)?);
        let storage = Arc::new(DebugStorage::new(&config.storage, bus.clone()).await?);
        let collector = Arc::new(EventCollector::new(
            config.collector.clone(),
            Arc::clone(&filter),
            bus.clone(),
        ));
        let recorder = Arc::new(DebugRecorder::new(
            config.recorder.clone(),
            filter,
            Arc::clone(&storage),
            Arc::clone(&collector),
            bus.clone(),
        ));
        let analyzer = PerformanceAnalyzer::new(config.analyzer.clone(), Arc::clone(&storage));
        let replay = ReplayEngine::new(config.replay.clone(), Arc::clone(&recorder), factory, bus.clone());
        let validator = PipelineValidator::new(routing, bus.clone());

        tracing::info!(
            base_dir = %storage.base_dir().display(),
            compression = config.storage.compression,
            live_pipelines = manager.is_some(),
            "Debug system initialized"
        );

        Ok(Self {
            config,
            bus,
            storage,
            collector,
            recorder,
            analyzer,
            replay,
            validator,
            manager,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the collector flush timer, retention cleanup and idle-session
    /// sweep
    ///
    /// An immediate cleanup pass runs first. Calling `start` while tasks are
    /// running does nothing.
    pub async fn start(&self) {
        if !self.tasks.lock().unwrap_or_else(|p| p.into_inner()).is_empty() {
            return;
        }

        crate::metrics::init_metric_descriptions();

        let retention = RetentionConfig::from(&self.config.storage);
        run_cleanup_now(&self.storage, retention.retention_days).await;

        let mut started = Vec::new();
        if let Some(task) = self.collector.start() {
            started.push(task);
        }
        started.push(spawn_cleanup_task(Arc::clone(&self.storage), retention));
        if let Some(idle_timeout) = self.config.recorder.session_idle_timeout() {
            started.push(spawn_idle_session_task(
                Arc::clone(&self.recorder),
                idle_timeout,
                self.config.recorder.idle_check_interval(),
            ));
        }

        tracing::info!(tasks = started.len(), "Debug background tasks started");
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(started);
    }

    /// End every active session (flushing pending records) and stop tasks
    pub async fn shutdown(&self) {
        for session in self.recorder.active_sessions() {
            if let Err(e) = self.recorder.end_session(&session.session_id).await {
                tracing::warn!(session_id = %session.session_id, error = %e, "Failed to end session on shutdown");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.stop().await;
        }

        self.collector.flush();
        tracing::info!("Debug system shut down");
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Startup topology gate over the attached manager
    pub fn validate_on_startup(&self) -> Result<ValidationReport> {
        let manager = self.require_manager()?;
        self.validator.validate_on_startup(manager.as_ref())
    }

    pub fn validate(&self) -> Result<ValidationReport> {
        let manager = self.require_manager()?;
        Ok(self.validator.validate(manager.as_ref()))
    }

    /// Request-flow diagnostic bound to the attached manager
    pub fn diagnostic(
        &self,
        router: Arc<dyn PipelineRouter>,
        selector: Option<Arc<dyn PipelineSelector>>,
    ) -> Result<RequestFlowDiagnostic> {
        let manager = Arc::clone(self.require_manager()?);
        let diagnostic =
            RequestFlowDiagnostic::new(manager, router, self.config.routing.clone(), self.bus.clone());
        Ok(match selector {
            Some(selector) => diagnostic.with_selector(selector),
            None => diagnostic,
        })
    }

    fn require_manager(&self) -> Result<&Arc<dyn PipelineManager>> {
        self.manager
            .as_ref()
            .ok_or_else(|| DebugError::Config("no pipeline manager attached".to_string()))
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<DebugStorage> {
        &self.storage
    }

    pub fn collector(&self) -> &Arc<EventCollector> {
        &self.collector
    }

    pub fn recorder(&self) -> &Arc<DebugRecorder> {
        &self.recorder
    }

    pub fn analyzer(&self) -> &PerformanceAnalyzer {
        &self.analyzer
    }

    pub fn replay(&self) -> &ReplayEngine {
        &self.replay
    }

    pub fn validator(&self) -> &PipelineValidator {
        &self.validator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::events::DebugNotification;
    use crate::record::{PipelineTrace, RequestSnapshot, ResponseSnapshot};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> DebugConfig {
        DebugConfig {
            storage: StorageConfig {
                base_dir: dir.path().to_path_buf(),
                ..StorageConfig::default()
            },
            ..DebugConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_record_shutdown() {
        let dir = TempDir::new().unwrap();
        let system = DebugSystem::new(test_config(&dir), RoutingTable::default(), None)
            .await
            .unwrap();
        let mut rx = system.bus().subscribe();

        system.start().await;
        assert_eq!(system.running_tasks(), 3);
        system.start().await;
        assert_eq!(system.running_tasks(), 3);

        let session = system.recorder().create_session(8080, json!({})).await.unwrap();
        system.recorder().record_request(
            &session.session_id,
            "req-1",
            RequestSnapshot::new("POST", "/v1/messages", json!({"model": "claude"})),
            PipelineTrace::new("anthropic.claude.key0", "anthropic", "claude"),
        );
        system
            .recorder()
            .record_response("req-1", ResponseSnapshot::new(200, json!({"ok": true}), 25))
            .await;

        system.shutdown().await;
        assert_eq!(system.running_tasks(), 0);
        assert!(system.recorder().active_sessions().is_empty());

        let record = system.recorder().load_record("req-1").await.unwrap();
        assert_eq!(record.session_id, session.session_id);

        let mut ended = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, DebugNotification::SessionEnded { request_count: 1, .. }) {
                ended = true;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn test_validation_requires_manager() {
        let dir = TempDir::new().unwrap();
        let system = DebugSystem::new(test_config(&dir), RoutingTable::default(), None)
            .await
            .unwrap();

        assert!(matches!(system.validate_on_startup(), Err(DebugError::Config(_))));
        assert!(system.validate().is_err());
    }
}
