//! Debug events and lifecycle notifications
//!
//! `DebugEvent`s are the ephemeral feed buffered by the collector.
//! `DebugNotification`s are the stable structured shapes published to
//! external subscribers over a broadcast channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::record::current_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugEventType {
    SessionStart,
    SessionEnd,
    Request,
    Response,
    ModuleInput,
    ModuleOutput,
    ModuleError,
    Error,
    Custom,
}

impl DebugEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Request => "request",
            Self::Response => "response",
            Self::ModuleInput => "module_input",
            Self::ModuleOutput => "module_output",
            Self::ModuleError => "module_error",
            Self::Error => "error",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for DebugEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: DebugEventType,
    pub timestamp: u64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DebugEvent {
    pub fn new(event_type: DebugEventType, session_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: current_millis(),
            session_id: session_id.into(),
            request_id: None,
            module_name: None,
            data,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Why the collector buffer was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Interval,
    HighWaterMark,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugNotification {
    SessionCreated {
        session_id: String,
        port: u16,
    },
    SessionEnded {
        session_id: String,
        port: u16,
        request_count: u64,
        error_count: u64,
    },
    RecordSaved {
        request_id: String,
        session_id: String,
        port: u16,
    },
    RecordDropped {
        request_id: String,
        reason: String,
    },
    BufferOverflow {
        dropped_event_id: String,
        capacity: usize,
    },
    Flushed {
        trigger: FlushTrigger,
        events: Vec<DebugEvent>,
    },
    StorageError {
        operation: String,
        message: String,
    },
    CleanupCompleted {
        sessions_deleted: usize,
    },
    ReplayCompleted {
        request_id: String,
        is_valid: bool,
        difference_count: usize,
    },
    ValidationCompleted {
        is_valid: bool,
        pipeline_count: usize,
    },
    ValidationFailed {
        message: String,
    },
    DiagnosisCompleted {
        pipeline_id: Option<String>,
        success: bool,
        failed_layer: Option<String>,
    },
}

/// Broadcast bus for notifications
///
/// Publishing never blocks and never fails: with no subscribers the
/// notification is discarded, and slow subscribers observe `Lagged`.
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<DebugNotification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugNotification> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notification: DebugNotification) {
        let _ = self.sender.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
