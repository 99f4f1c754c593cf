//! Persisted data model: sessions, request records and per-layer module records
//!
//! Field names serialize in camelCase; this is the on-disk JSON shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Recording window for one port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSession {
    pub session_id: String,
    pub port: u16,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    pub request_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub active_pipeline_ids: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DebugSession {
    pub fn new(session_id: impl Into<String>, port: u16, metadata: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            port,
            start_time: current_millis(),
            end_time: None,
            request_count: 0,
            error_count: 0,
            active_pipeline_ids: Vec::new(),
            metadata,
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Session length so far (or total, once closed)
    pub fn duration_ms(&self) -> u64 {
        self.end_time
            .unwrap_or_else(current_millis)
            .saturating_sub(self.start_time)
    }
}

/// Inbound request as seen by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl RequestSnapshot {
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body,
        }
    }
}

/// Response returned to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Wall time from request arrival to response (milliseconds)
    pub duration: u64,
}

impl ResponseSnapshot {
    pub fn new(status: u16, body: serde_json::Value, duration: u64) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
            duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RecordedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<&anyhow::Error> for RecordedError {
    fn from(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            message: err.to_string(),
            code: None,
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

/// One layer touch within a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub module_name: String,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub input: serde_json::Value,
    /// `Some(Value::Null)` when the layer returned `null`
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ModuleRecord {
    pub fn open(module_name: impl Into<String>, input: serde_json::Value, metadata: serde_json::Value) -> Self {
        Self {
            module_name: module_name.into(),
            start_time: current_millis(),
            end_time: None,
            duration: None,
            input,
            output: None,
            error: None,
            metadata,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Close the record at `end_time`; duration never goes negative
    pub fn close(&mut self, end_time: u64) {
        let end_time = end_time.max(self.start_time);
        self.end_time = Some(end_time);
        self.duration = Some(end_time - self.start_time);
    }
}

/// Any present value, `null` included, is `Some`; only a missing key
/// falls back to the field default
pub(crate) fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Pipeline that served the request plus its layer trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTrace {
    pub id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
}

impl PipelineTrace {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            model: model.into(),
            modules: Vec::new(),
        }
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.module_name.as_str()).collect()
    }
}

/// Captured request/response/error/per-layer trace for one client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp: u64,
    pub port: u16,
    pub session_id: String,
    pub request: RequestSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
    pub pipeline: PipelineTrace,
}

impl RequestRecord {
    /// Request and response both captured
    pub fn is_complete(&self) -> bool {
        self.response.is_some()
    }

    /// Failed either with a recorded error or an error status
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.response.as_ref().map_or(false, |r| r.status >= 400)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.response.as_ref().map(|r| r.duration)
    }
}

/// Get current time as Unix milliseconds
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    /// A complete record with two module touches, for tests across the crate
    pub fn sample_record(request_id: &str, port: u16, session_id: &str) -> RequestRecord {
        let mut transformer = ModuleRecord::open(
            "transformer",
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
            json!({"version": "1"}),
        );
        transformer.output = Some(json!({"messages": [{"role": "user", "content": "hi"}]}));
        transformer.close(transformer.start_time + 3);

        let mut server = ModuleRecord::open("server", json!({"url": "https://api.openai.com"}), json!({}));
        server.output = Some(json!({"status": 200}));
        server.close(server.start_time + 40);

        RequestRecord {
            request_id: request_id.to_string(),
            timestamp: current_millis(),
            port,
            session_id: session_id.to_string(),
            request: RequestSnapshot::new(
                "POST",
                "/v1/chat/completions",
                json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
            ),
            response: Some(ResponseSnapshot::new(
                200,
                json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "model": "gpt-4",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 1}
                }),
                120,
            )),
            error: None,
            pipeline: PipelineTrace {
                id: "openai.gpt-4.key1".to_string(),
                provider: "openai".to_string(),
                model: "gpt-4".to_string(),
                modules: vec![transformer, server],
            },
        }
    }
}
