use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub routing: RoutingHeuristicsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory; each port gets its own `port-<N>` subdirectory
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default = "default_true")]
    pub compression: bool,

    /// gzip level (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Structurally validate records when reading them back
    #[serde(default = "default_true")]
    pub validate_on_read: bool,

    #[serde(default = "default_max_record_size")]
    pub max_record_size_bytes: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            compression: true,
            compression_level: default_compression_level(),
            validate_on_read: true,
            max_record_size_bytes: default_max_record_size(),
            retention_days: default_retention_days(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// What happens when the event buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event to make room
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,

    /// Enables both the interval timer and the high-water-mark flush
    #[serde(default = "default_true")]
    pub auto_flush: bool,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Fraction of capacity that triggers a flush on insert
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: f64,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            auto_flush: true,
            flush_interval_ms: default_flush_interval_ms(),
            high_water_mark: default_high_water_mark(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl CollectorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Buffer length at which an insert triggers a flush
    pub fn high_water_mark_len(&self) -> usize {
        ((self.capacity as f64) * self.high_water_mark).ceil().max(1.0) as usize
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Key names whose values are always redacted
    ///
    /// Matching is case-insensitive and by trailing whole segments of the
    /// key (split on `-`, `_`, `.` and camelCase): `apikey` matches
    /// `x-api-key` and `openaiApiKey`. A short entry such as `id` would also
    /// match `request_id`; put those in `exact_sensitive_keys` instead.
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,

    /// Key names redacted only when they are the whole key
    #[serde(default)]
    pub exact_sensitive_keys: Vec<String>,

    /// Extra regexes; any string value matching one is redacted
    #[serde(default)]
    pub extra_value_patterns: Vec<String>,

    #[serde(default = "default_replacement")]
    pub replacement: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sensitive_keys: default_sensitive_keys(),
            exact_sensitive_keys: Vec::new(),
            extra_value_patterns: Vec::new(),
            replacement: default_replacement(),
        }
    }
}

/// What a forced flush does with records that never got a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingFlushPolicy {
    /// Persist only records with both request and response; drop the rest
    #[default]
    CompleteOnly,
    /// Persist everything that is pending
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub pending_flush_policy: PendingFlushPolicy,

    /// Sessions with no recording activity for this long are ended (0 disables)
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_seconds: u64,

    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_seconds: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            pending_flush_policy: PendingFlushPolicy::default(),
            session_idle_timeout_seconds: default_session_idle_timeout(),
            idle_check_interval_seconds: default_idle_check_interval(),
        }
    }
}

impl RecorderConfig {
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_seconds > 0).then(|| Duration::from_secs(self.session_idle_timeout_seconds))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    /// Number of requests replayed concurrently in one batch group
    #[serde(default = "default_replay_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_replay_timeout")]
    pub timeout_seconds: u64,

    /// Drop the in-flight pipeline call on timeout instead of letting it finish
    #[serde(default)]
    pub abort_on_timeout: bool,

    #[serde(default = "default_tolerance_percent")]
    pub tolerance_percent: f64,

    #[serde(default = "default_ignore_fields")]
    pub ignore_fields: Vec<String>,

    /// Top-level response fields that must match for a replay to be accepted
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            concurrency: default_replay_concurrency(),
            timeout_seconds: default_replay_timeout(),
            abort_on_timeout: false,
            tolerance_percent: default_tolerance_percent(),
            ignore_fields: default_ignore_fields(),
            key_fields: default_key_fields(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    /// Width of time-series buckets
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: u64,

    #[serde(default = "default_latency_threshold")]
    pub latency_threshold_ms: f64,

    /// Error rate (0.0-1.0) above which a recommendation is produced
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_module_latency_threshold")]
    pub module_latency_threshold_ms: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: default_bucket_seconds(),
            latency_threshold_ms: default_latency_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            module_latency_threshold_ms: default_module_latency_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingHeuristicsConfig {
    /// Estimated token count above which a request is long-context
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,

    /// Substrings of model names routed to the background bucket
    #[serde(default = "default_background_models")]
    pub background_models: Vec<String>,
}

impl Default for RoutingHeuristicsConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            background_models: default_background_models(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data/debug")
}

fn default_compression_level() -> u32 {
    6
}

fn default_max_record_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_high_water_mark() -> f64 {
    0.9
}

fn default_sensitive_keys() -> Vec<String> {
    [
        "password",
        "passwd",
        "token",
        "secret",
        "credential",
        "credentials",
        "authorization",
        "apikey",
        "cookie",
        "bearer",
        "privatekey",
        "sessionid",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_session_idle_timeout() -> u64 {
    1800
}

fn default_idle_check_interval() -> u64 {
    60
}

fn default_replacement() -> String {
    "[REDACTED]".to_string()
}

fn default_replay_concurrency() -> usize {
    3
}

fn default_replay_timeout() -> u64 {
    30
}

fn default_tolerance_percent() -> f64 {
    10.0
}

fn default_ignore_fields() -> Vec<String> {
    ["id", "created", "timestamp", "requestId", "system_fingerprint"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_key_fields() -> Vec<String> {
    ["model", "object", "type", "role", "stop_reason"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bucket_seconds() -> u64 {
    60
}

fn default_latency_threshold() -> f64 {
    1000.0
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_module_latency_threshold() -> f64 {
    500.0
}

fn default_long_context_threshold() -> usize {
    60_000
}

fn default_background_models() -> Vec<String> {
    vec!["haiku".to_string(), "mini".to_string(), "flash-lite".to_string()]
}

/// Load the debug configuration from `debug.{toml,yaml,json}` (optional)
/// and `LLM_GATEWAY_DEBUG__*` environment variables.
pub fn load_config() -> anyhow::Result<DebugConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("debug").required(false))
        .add_source(config::Environment::with_prefix("LLM_GATEWAY_DEBUG").separator("__"))
        .build()?;

    let cfg: DebugConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &DebugConfig) -> anyhow::Result<()> {
    if cfg.collector.capacity == 0 {
        anyhow::bail!("Collector capacity must be greater than zero");
    }

    if !(cfg.collector.high_water_mark > 0.0 && cfg.collector.high_water_mark <= 1.0) {
        anyhow::bail!(
            "Collector high_water_mark must be in (0, 1], got {}",
            cfg.collector.high_water_mark
        );
    }

    if cfg.collector.auto_flush && cfg.collector.flush_interval_ms == 0 {
        anyhow::bail!("Collector flush_interval_ms must be greater than zero when auto_flush is enabled");
    }

    if cfg.storage.compression_level > 9 {
        anyhow::bail!(
            "Storage compression_level must be between 0 and 9, got {}",
            cfg.storage.compression_level
        );
    }

    if cfg.storage.max_record_size_bytes == 0 {
        anyhow::bail!("Storage max_record_size_bytes must be greater than zero");
    }

    if cfg.replay.concurrency == 0 {
        anyhow::bail!("Replay concurrency must be at least 1");
    }

    if cfg.replay.tolerance_percent < 0.0 {
        anyhow::bail!("Replay tolerance_percent cannot be negative");
    }

    if cfg.analyzer.bucket_seconds == 0 {
        anyhow::bail!("Analyzer bucket_seconds must be greater than zero");
    }

    for pattern in &cfg.filter.extra_value_patterns {
        if let Err(e) = regex::Regex::new(pattern) {
            anyhow::bail!("Invalid filter pattern '{}': {}", pattern, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = DebugConfig::default();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.collector.capacity, 1000);
        assert_eq!(cfg.replay.concurrency, 3);
        assert_eq!(cfg.replay.timeout_seconds, 30);
        assert_eq!(cfg.routing.long_context_threshold, 60_000);
    }

    #[test]
    fn test_validate_config_rejects_zero_capacity() {
        let mut cfg = DebugConfig::default();
        cfg.collector.capacity = 0;

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("capacity"));
    }

    #[test]
    fn test_validate_config_rejects_bad_pattern() {
        let mut cfg = DebugConfig::default();
        cfg.filter.extra_value_patterns.push("([unclosed".to_string());

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid filter pattern"));
    }

    #[test]
    fn test_high_water_mark_len() {
        let cfg = CollectorConfig {
            capacity: 1000,
            high_water_mark: 0.9,
            ..CollectorConfig::default()
        };
        assert_eq!(cfg.high_water_mark_len(), 900);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"storage": {"base_dir": "/tmp/dbg", "compression": false}}"#;
        let cfg: DebugConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.storage.base_dir, PathBuf::from("/tmp/dbg"));
        assert!(!cfg.storage.compression);
        assert!(cfg.storage.validate_on_read);
        assert_eq!(cfg.collector.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(
            cfg.recorder.pending_flush_policy,
            PendingFlushPolicy::CompleteOnly
        );
        assert_eq!(cfg.recorder.session_idle_timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(cfg.recorder.idle_check_interval(), Duration::from_secs(60));
    }
}
