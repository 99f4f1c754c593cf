/// Integration tests for replaying recorded requests
use async_trait::async_trait;
use llm_gateway_debug::{
    analyzer::{render_replay_results, ExportFormat},
    config::{DebugConfig, ReplayConfig, StorageConfig},
    pipeline::{
        Layer, LayerSlot, Pipeline, PipelineBlueprint, PipelineFactory, PipelineManager, PipelineRegistry,
        RoutingTable,
    },
    record::{PipelineTrace, RecordedError, RequestSnapshot, ResponseSnapshot},
    replay::{DifferenceKind, ReplayOptions},
    DebugError, DebugSystem,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir, replay: ReplayConfig) -> DebugConfig {
    DebugConfig {
        storage: StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        replay,
        ..DebugConfig::default()
    }
}

fn response_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-x",
        "object": "chat.completion",
        "model": "gpt-4",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
    })
}

async fn record_requests(system: &DebugSystem, ids: &[String]) {
    let session = system.recorder().create_session(8080, json!({})).await.unwrap();
    for id in ids {
        system.recorder().record_request(
            &session.session_id,
            id,
            RequestSnapshot::new("POST", "/v1/chat/completions", json!({"model": "gpt-4", "messages": []})),
            PipelineTrace::new("openai.gpt-4.key0", "openai", "gpt-4"),
        );
        system
            .recorder()
            .record_response(id, ResponseSnapshot::new(200, response_body("hello"), 50))
            .await;
    }
}

/// Pipeline that tracks how many executions overlap
struct ConcurrencyTracker {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Pipeline for ConcurrencyTracker {
    fn id(&self) -> &str {
        "openai.gpt-4.key0"
    }

    async fn execute(&self, _request: Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response_body("hello"))
    }

    fn layer(&self, _layer: Layer) -> LayerSlot {
        LayerSlot::Absent
    }
}

struct TrackerFactory(Arc<ConcurrencyTracker>);

#[async_trait]
impl PipelineFactory for TrackerFactory {
    async fn build(&self, _blueprint: &PipelineBlueprint) -> anyhow::Result<Arc<dyn Pipeline>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_batch_replay_respects_concurrency_ceiling() {
    let dir = TempDir::new().unwrap();
    let tracker = Arc::new(ConcurrencyTracker {
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let system = DebugSystem::with_factory(
        config(&dir, ReplayConfig::default()),
        RoutingTable::default(),
        None,
        Arc::new(TrackerFactory(tracker.clone())),
    )
    .await
    .unwrap();

    let ids: Vec<String> = (0..7).map(|i| format!("req-{}", i)).collect();
    record_requests(&system, &ids).await;

    let summary = system.replay().batch_replay(&ids, &ReplayOptions::default()).await;

    assert_eq!(summary.total, 7);
    assert_eq!(summary.valid, 7);
    assert_eq!(summary.failed, 0);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 7);
    let peak = tracker.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {}", peak);
    assert!(peak >= 2, "groups should run concurrently, peak was {}", peak);
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let dir = TempDir::new().unwrap();
    let system = DebugSystem::new(config(&dir, ReplayConfig::default()), RoutingTable::default(), None)
        .await
        .unwrap();

    let ids = vec!["a".to_string(), "b".to_string()];
    record_requests(&system, &ids).await;

    let mut requested = ids.clone();
    requested.insert(1, "missing".to_string());
    let summary = system.replay().batch_replay(&requested, &ReplayOptions::default()).await;

    assert_eq!(summary.total, 3);
    assert_eq!(summary.valid, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].request_id, "missing");
}

#[tokio::test]
async fn test_live_regression_is_detected_and_exported() {
    let dir = TempDir::new().unwrap();

    struct Regressed;

    #[async_trait]
    impl Pipeline for Regressed {
        fn id(&self) -> &str {
            "openai.gpt-4.key0"
        }

        async fn execute(&self, _request: Value) -> anyhow::Result<Value> {
            let mut body = response_body("hello");
            body["object"] = json!("chat.completion.chunk");
            Ok(body)
        }

        fn layer(&self, _layer: Layer) -> LayerSlot {
            LayerSlot::Absent
        }
    }

    let registry = Arc::new(PipelineRegistry::new());
    registry.register(Arc::new(Regressed));
    let system = DebugSystem::new(
        config(&dir, ReplayConfig::default()),
        RoutingTable::default(),
        Some(registry as Arc<dyn PipelineManager>),
    )
    .await
    .unwrap();

    record_requests(&system, &["r1".to_string()]).await;

    let result = system.replay().replay_request("r1", &ReplayOptions::default()).await.unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.differences.len(), 1);
    assert_eq!(result.differences[0].path, "object");
    assert_eq!(result.differences[0].kind, DifferenceKind::Modified);
    assert!(!result.outcome.response_same);
    assert!(result.outcome.error_same);

    let csv = render_replay_results(&[result], ExportFormat::Csv).unwrap();
    assert!(csv.lines().nth(1).unwrap().starts_with("r1,false,50,"));
}

#[tokio::test]
async fn test_recorded_error_replays_as_error() {
    let dir = TempDir::new().unwrap();
    let system = DebugSystem::new(config(&dir, ReplayConfig::default()), RoutingTable::default(), None)
        .await
        .unwrap();

    let session = system.recorder().create_session(8080, json!({})).await.unwrap();
    system.recorder().record_request(
        &session.session_id,
        "err-1",
        RequestSnapshot::new("POST", "/v1/chat/completions", json!({})),
        PipelineTrace::new("openai.gpt-4.key0", "openai", "gpt-4"),
    );
    system
        .recorder()
        .record_error("err-1", &RecordedError::new("upstream timeout"))
        .await;

    let result = system.replay().replay_request("err-1", &ReplayOptions::default()).await.unwrap();
    assert!(result.replayed.error.is_some());
    assert!(result.is_valid);
    assert_eq!(system.replay().cached_entries(), 1);
}

#[tokio::test]
async fn test_abort_on_timeout() {
    let dir = TempDir::new().unwrap();

    struct Hangs(Arc<AtomicUsize>);

    #[async_trait]
    impl Pipeline for Hangs {
        fn id(&self) -> &str {
            "openai.gpt-4.key0"
        }

        async fn execute(&self, _request: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }

        fn layer(&self, _layer: Layer) -> LayerSlot {
            LayerSlot::Absent
        }
    }

    let finished = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(PipelineRegistry::new());
    registry.register(Arc::new(Hangs(finished.clone())));

    let replay = ReplayConfig {
        timeout_seconds: 1,
        abort_on_timeout: true,
        ..ReplayConfig::default()
    };
    let system = DebugSystem::new(config(&dir, replay), RoutingTable::default(), Some(registry as Arc<dyn PipelineManager>))
        .await
        .unwrap();
    record_requests(&system, &["slow".to_string()]).await;

    let err = system.replay().replay_request("slow", &ReplayOptions::default()).await.unwrap_err();
    assert!(matches!(err, DebugError::Timeout { .. }));

    // The aborted call never completes
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}
