use std::time::Duration;
use thiserror::Error;

/// Debug subsystem error types
#[derive(Debug, Error)]
pub enum DebugError {
    /// Recording failed (session/record bookkeeping)
    #[error("Record error: {0}")]
    Record(String),

    /// Replay of a stored request failed
    #[error("Replay error for request {request_id}: {message}")]
    Replay { request_id: String, message: String },

    /// Integrity check failed while reading a stored record
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialized record exceeds the configured size limit
    #[error("Record size {size} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded { size: usize, limit: usize },

    /// Operation did not finish in time
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// Live pipeline set differs from the routing table
    #[error("Pipeline configuration mismatch: missing [{}], unexpected [{}]", missing.join(", "), unexpected.join(", "))]
    ConfigurationMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// A pipeline is missing one of its layers
    #[error("Pipeline '{pipeline_id}' is incomplete: missing layers [{}]", missing_layers.join(", "))]
    ArchitectureIncomplete {
        pipeline_id: String,
        missing_layers: Vec<String>,
    },

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DebugError {
    /// Stable short name used in notifications and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Record(_) => "record_error",
            Self::Replay { .. } => "replay_error",
            Self::Validation(_) => "validation_error",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::ConfigurationMismatch { .. } => "configuration_mismatch",
            Self::ArchitectureIncomplete { .. } => "architecture_incomplete",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Attach a request id to an error raised while replaying it
    pub fn for_replay(request_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Replay {
            request_id: request_id.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, DebugError>;
