pub mod analyzer;
pub mod collector;
pub mod config;
pub mod debug_system;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod recorder;
pub mod replay;
pub mod router;
pub mod serializer;
pub mod storage;
pub mod task;
pub mod validator;

pub use debug_system::DebugSystem;
pub use error::{DebugError, Result};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once. Embedding gateways that
/// install their own subscriber should skip it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// JSON-formatted variant of [`init_tracing`] for log shipping
pub fn init_json_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();
}
