/// Integration tests for the recording path: sessions, filtering,
/// persistence, queries and retention
use llm_gateway_debug::{
    config::{DebugConfig, StorageConfig},
    pipeline::RoutingTable,
    record::{PipelineTrace, RecordedError, RequestSnapshot, ResponseSnapshot},
    storage::RecordQuery,
    DebugSystem,
};
use serde_json::json;
use tempfile::TempDir;

async fn create_system(dir: &TempDir) -> DebugSystem {
    let config = DebugConfig {
        storage: StorageConfig {
            base_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        ..DebugConfig::default()
    };
    DebugSystem::new(config, RoutingTable::default(), None)
        .await
        .unwrap()
}

/// Record one request through all layers; `outcome` picks success, an
/// error status or a thrown error
async fn record_one(system: &DebugSystem, session_id: &str, request_id: &str, outcome: u8) {
    let recorder = system.recorder();
    recorder.record_request(
        session_id,
        request_id,
        RequestSnapshot::new(
            "POST",
            "/v1/chat/completions",
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        ),
        PipelineTrace::new("openai.gpt-4.key0", "openai", "gpt-4"),
    );

    for layer in ["transformer", "protocol", "serverCompatibility", "server"] {
        recorder.record_module_input(request_id, layer, &json!({"step": layer}), json!({}));
        recorder.record_module_output(request_id, layer, &json!({"ok": true}));
    }

    match outcome {
        0 => {
            recorder
                .record_response(
                    request_id,
                    ResponseSnapshot::new(200, json!({"model": "gpt-4", "choices": []}), 80),
                )
                .await
        }
        1 => {
            recorder
                .record_response(request_id, ResponseSnapshot::new(500, json!({"error": "boom"}), 30))
                .await
        }
        _ => {
            recorder
                .record_error(request_id, &RecordedError::new("connection reset").with_code("ECONNRESET"))
                .await
        }
    }
}

#[tokio::test]
async fn test_session_of_twelve_with_two_errors() {
    let dir = TempDir::new().unwrap();
    let system = create_system(&dir).await;

    let session = system.recorder().create_session(8080, json!({"env": "test"})).await.unwrap();
    for i in 0..12 {
        let outcome = match i {
            3 => 1,
            8 => 2,
            _ => 0,
        };
        record_one(&system, &session.session_id, &format!("req-{}", i), outcome).await;
    }

    let ended = system.recorder().end_session(&session.session_id).await.unwrap();
    assert_eq!(ended.request_count, 12);
    assert_eq!(ended.error_count, 2);
    assert!(ended.end_time.is_some());

    let stored = system.storage().load_session(8080, &session.session_id).await.unwrap();
    assert_eq!(stored, ended);

    let report = system.analyzer().analyze_session(&session.session_id).await.unwrap();
    assert_eq!(report.metrics.total_requests, 12);
    assert!((report.metrics.error_rate - 2.0 / 12.0).abs() < 1e-9);
    assert!((report.metrics.success_rate - 10.0 / 12.0).abs() < 1e-9);
    assert_eq!(report.metrics.modules.len(), 4);

    let record = system.recorder().load_record("req-5").await.unwrap();
    let layers: Vec<_> = record.pipeline.module_names();
    assert_eq!(layers, vec!["transformer", "protocol", "serverCompatibility", "server"]);
    assert!(record.pipeline.modules.iter().all(|m| m.duration.is_some()));
}

#[tokio::test]
async fn test_secrets_never_reach_disk() {
    let dir = TempDir::new().unwrap();
    let system = create_system(&dir).await;
    let session = system.recorder().create_session(9000, json!({})).await.unwrap();

    let mut request = RequestSnapshot::new(
        "POST",
        "/v1/messages",
        json!({"model": "claude", "api_key": "plain-value", "metadata": {"note": "sk-abcdefghijklmnopqrstuvwx"}}),
    );
    request
        .headers
        .insert("Authorization".to_string(), "Bearer abc.def".to_string());

    system.recorder().record_request(
        &session.session_id,
        "secret-1",
        request,
        PipelineTrace::new("anthropic.claude.key0", "anthropic", "claude"),
    );
    system
        .recorder()
        .record_response("secret-1", ResponseSnapshot::new(200, json!({"ok": true}), 10))
        .await;

    let record = system.recorder().load_record("secret-1").await.unwrap();
    assert_eq!(record.request.body["api_key"], "[REDACTED]");
    assert_eq!(record.request.headers["Authorization"], "[REDACTED]");
    assert!(!record.request.body["metadata"]["note"]
        .as_str()
        .unwrap()
        .contains("abcdefghijklmnop"));
}

#[tokio::test]
async fn test_find_records_across_ports() {
    let dir = TempDir::new().unwrap();
    let system = create_system(&dir).await;

    for port in [8080u16, 8081, 8082] {
        let session = system.recorder().create_session(port, json!({})).await.unwrap();
        for i in 0..8 {
            let outcome = if i % 2 == 0 { 1 } else { 0 };
            record_one(&system, &session.session_id, &format!("p{}-r{}", port, i), outcome).await;
        }
    }

    let query = RecordQuery {
        has_error: Some(true),
        limit: Some(5),
        ..RecordQuery::for_port(8080)
    };
    let records = system.recorder().find_records(&query).await.unwrap();

    assert!(!records.is_empty());
    assert!(records.len() <= 5);
    assert!(records.iter().all(|r| r.port == 8080 && r.is_error()));
    assert!(records.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    let stats = system.storage().storage_statistics().await.unwrap();
    assert_eq!(stats.total_ports, 3);
    assert_eq!(stats.total_records, 24);
}

#[tokio::test]
async fn test_incomplete_requests_dropped_on_session_end() {
    let dir = TempDir::new().unwrap();
    let system = create_system(&dir).await;
    let session = system.recorder().create_session(8080, json!({})).await.unwrap();

    record_one(&system, &session.session_id, "done", 0).await;
    system.recorder().record_request(
        &session.session_id,
        "in-flight",
        RequestSnapshot::new("POST", "/v1/chat/completions", json!({})),
        PipelineTrace::default(),
    );
    assert_eq!(system.recorder().pending_count(), 1);

    system.recorder().end_session(&session.session_id).await.unwrap();
    assert_eq!(system.recorder().pending_count(), 0);

    assert!(system.recorder().load_record("done").await.is_ok());
    assert!(system.recorder().load_record("in-flight").await.is_err());
}

#[tokio::test]
async fn test_cleanup_keeps_recent_sessions() {
    let dir = TempDir::new().unwrap();
    let system = create_system(&dir).await;
    let session = system.recorder().create_session(8080, json!({})).await.unwrap();
    record_one(&system, &session.session_id, "fresh", 0).await;

    let deleted = system.storage().cleanup_expired_data(7).await.unwrap();
    assert_eq!(deleted, 0);
    assert!(system.recorder().load_record("fresh").await.is_ok());
}
