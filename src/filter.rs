//! Sensitive data filtering
//!
//! Redacts secrets from arbitrary JSON before it is stored on disk or handed
//! to the event collector. Two independent checks apply:
//!
//! - **Key names**: values under keys such as `authorization`, `api_key` or
//!   `x-session-token` are replaced wholesale, whatever their type.
//! - **Value shapes**: provider keys (`sk-...`, `AIza...`), bearer tokens and
//!   strings that are entirely base64, hex or a UUID are redacted no matter
//!   which key they sit under.
//!
//! Filtering produces a deep copy and is idempotent.

use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::config::FilterConfig;
use crate::error::{DebugError, Result};
use crate::record::RecordedError;

/// Patterns redacted wherever they appear inside a string
const INLINE_PATTERNS: &[&str] = &[
    r"\bsk-[A-Za-z0-9_\-]{16,}",
    r"\bAIza[0-9A-Za-z_\-]{35}",
    r"\bAKIA[0-9A-Z]{16}\b",
    r"\bgh[pousr]_[A-Za-z0-9]{30,}",
    r"(?i)\bbearer\s+[A-Za-z0-9._~+/\-]{16,}=*",
];

/// Patterns that must match the whole string
const WHOLE_VALUE_PATTERNS: &[&str] = &[
    r"^[A-Za-z0-9+/]{40,}={0,2}$",
    r"^[0-9a-fA-F]{32,}$",
    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
];

/// Result of filtering one value
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub filtered: Value,
    pub has_changes: bool,
    /// Paths (`a.b[0].c`) whose values were redacted
    pub sensitive_field_paths: Vec<String>,
}

pub struct SensitiveDataFilter {
    sensitive_keys: Vec<String>,
    exact_keys: Vec<String>,
    inline_patterns: Vec<Regex>,
    whole_value_patterns: Vec<Regex>,
    home_dir: Regex,
    windows_home_dir: Regex,
    absolute_path: Regex,
    replacement: String,
}

impl SensitiveDataFilter {
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| DebugError::Config(format!("Invalid filter pattern '{}': {}", pattern, e)))
        };

        let mut inline_patterns = INLINE_PATTERNS
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        for pattern in &config.extra_value_patterns {
            inline_patterns.push(compile(pattern)?);
        }

        let whole_value_patterns = WHOLE_VALUE_PATTERNS
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sensitive_keys: config
                .sensitive_keys
                .iter()
                .map(|k| normalize_key(k))
                .filter(|k| !k.is_empty())
                .collect(),
            exact_keys: config
                .exact_sensitive_keys
                .iter()
                .map(|k| normalize_key(k))
                .filter(|k| !k.is_empty())
                .collect(),
            inline_patterns,
            whole_value_patterns,
            home_dir: compile(r"(?:/home|/Users)/[^/\s:]+")?,
            windows_home_dir: compile(r"(?i)[A-Z]:\\Users\\[^\\\s]+")?,
            absolute_path: compile(r#"(^|[\s(\[@"'=])(?:/[\w.\-]+)+/([\w.\-]+)"#)?,
            replacement: config.replacement.clone(),
        })
    }

    /// Filter a JSON value, returning a redacted deep copy
    pub fn filter(&self, value: &Value) -> FilterResult {
        let mut paths = Vec::new();
        let filtered = self.walk(value, "", &mut paths);

        FilterResult {
            has_changes: !paths.is_empty(),
            filtered,
            sensitive_field_paths: paths,
        }
    }

    /// Convenience wrapper returning only the filtered value
    pub fn filter_value(&self, value: &Value) -> Value {
        self.filter(value).filtered
    }

    /// Whether a key name marks its value as sensitive
    ///
    /// `sensitive_keys` match a trailing run of whole key segments, so
    /// `token` matches `x-session-token` but not `max_tokens` or `tokenizer`.
    /// `exact_sensitive_keys` only match the whole key.
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let segments = key_segments(key);
        if segments.is_empty() {
            return false;
        }

        let whole = segments.concat();
        if self.exact_keys.iter().any(|k| *k == whole) {
            return true;
        }

        (0..segments.len()).any(|start| {
            let suffix = segments[start..].concat();
            self.sensitive_keys.iter().any(|pattern| *pattern == suffix)
        })
    }

    /// Redact secrets inside a free-form string
    pub fn filter_text(&self, text: &str) -> String {
        self.redact_str(text).into_owned()
    }

    pub fn filter_headers(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if self.is_sensitive_key(name) {
                    self.replacement.clone()
                } else {
                    self.filter_text(value)
                };
                (name.clone(), value)
            })
            .collect()
    }

    /// Collapse home directories and absolute paths in a stack trace
    pub fn scrub_stack_trace(&self, stack: &str) -> String {
        let redacted = self.redact_inline(stack);
        let without_home = self.home_dir.replace_all(&redacted, "~");
        let without_home = self.windows_home_dir.replace_all(&without_home, "~");
        self.absolute_path
            .replace_all(&without_home, "${1}.../${2}")
            .into_owned()
    }

    pub fn filter_error(&self, error: &RecordedError) -> RecordedError {
        RecordedError {
            message: self.filter_text(&error.message),
            code: error.code.clone(),
            stack: error.stack.as_deref().map(|s| self.scrub_stack_trace(s)),
        }
    }

    fn walk(&self, value: &Value, path: &str, paths: &mut Vec<String>) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    let child_path = join_key(path, key);
                    if self.is_sensitive_key(key) {
                        if child.as_str() != Some(self.replacement.as_str()) {
                            paths.push(child_path);
                        }
                        out.insert(key.clone(), Value::String(self.replacement.clone()));
                    } else {
                        out.insert(key.clone(), self.walk(child, &child_path, paths));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.walk(item, &format!("{}[{}]", path, i), paths))
                    .collect(),
            ),
            Value::String(s) => match self.redact_str(s) {
                Cow::Borrowed(_) => value.clone(),
                Cow::Owned(redacted) => {
                    paths.push(path.to_string());
                    Value::String(redacted)
                }
            },
            _ => value.clone(),
        }
    }

    fn redact_str<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if s == self.replacement {
            return Cow::Borrowed(s);
        }
        if self.whole_value_patterns.iter().any(|re| re.is_match(s)) {
            return Cow::Owned(self.replacement.clone());
        }
        self.redact_inline(s)
    }

    fn redact_inline<'a>(&self, s: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(s);
        for re in &self.inline_patterns {
            if re.is_match(&current) {
                current = Cow::Owned(re.replace_all(&current, self.replacement.as_str()).into_owned());
            }
        }
        current
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Lowercased segments of a key, split on separators and camelCase humps
fn key_segments(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in key.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> SensitiveDataFilter {
        SensitiveDataFilter::new(&FilterConfig::default()).unwrap()
    }

    #[test]
    fn test_redacts_sensitive_keys_case_insensitive() {
        let input = json!({
            "Authorization": "Bearer abc",
            "x-api-key": "plain",
            "apiKey": {"nested": true},
            "access_token": 12345,
            "max_tokens": 100,
            "model": "gpt-4"
        });

        let result = filter().filter(&input);

        assert!(result.has_changes);
        assert_eq!(result.filtered["Authorization"], "[REDACTED]");
        assert_eq!(result.filtered["x-api-key"], "[REDACTED]");
        assert_eq!(result.filtered["apiKey"], "[REDACTED]");
        assert_eq!(result.filtered["access_token"], "[REDACTED]");
        assert_eq!(result.filtered["max_tokens"], 100);
        assert_eq!(result.filtered["model"], "gpt-4");
        assert_eq!(result.sensitive_field_paths.len(), 4);
    }

    #[test]
    fn test_key_patterns_match_whole_trailing_segments() {
        let f = filter();

        assert!(f.is_sensitive_key("x-session-token"));
        assert!(f.is_sensitive_key("OPENAI_API_KEY"));
        assert!(f.is_sensitive_key("sessionId"));
        assert!(!f.is_sensitive_key("tokenizer"));
        assert!(!f.is_sensitive_key("max_tokens"));
        assert!(!f.is_sensitive_key("request_id"));
    }

    #[test]
    fn test_exact_keys_leave_longer_keys_alone() {
        let config = FilterConfig {
            exact_sensitive_keys: vec!["id".to_string()],
            ..FilterConfig::default()
        };
        let f = SensitiveDataFilter::new(&config).unwrap();

        let result = f.filter(&json!({"id": "abc", "request_id": "req-1", "session_id": "s-1"}));

        assert_eq!(result.filtered["id"], "[REDACTED]");
        assert_eq!(result.filtered["request_id"], "req-1");
        assert_eq!(result.filtered["session_id"], "s-1");
    }

    #[test]
    fn test_bearer_needs_credential_shaped_token() {
        let f = filter();

        assert_eq!(f.filter_text("Bearer token is missing"), "Bearer token is missing");
        assert_eq!(
            f.filter_text("sent Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig upstream"),
            "sent [REDACTED] upstream"
        );
    }

    #[test]
    fn test_redacts_provider_keys_under_any_key() {
        let input = json!({
            "messages": [
                {"role": "user", "content": "my key is sk-proj-abcdefghijklmnop1234 please"}
            ]
        });

        let result = filter().filter(&input);

        assert_eq!(
            result.filtered["messages"][0]["content"],
            "my key is [REDACTED] please"
        );
        assert_eq!(result.sensitive_field_paths, vec!["messages[0].content".to_string()]);
    }

    #[test]
    fn test_redacts_whole_value_shapes() {
        let input = json!({
            "trace": "550e8400-e29b-41d4-a716-446655440000",
            "digest": "d41d8cd98f00b204e9800998ecf8427e",
            "blob": "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWZnaGlq",
            "note": "short text"
        });

        let result = filter().filter(&input);

        assert_eq!(result.filtered["trace"], "[REDACTED]");
        assert_eq!(result.filtered["digest"], "[REDACTED]");
        assert_eq!(result.filtered["blob"], "[REDACTED]");
        assert_eq!(result.filtered["note"], "short text");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let input = json!({
            "headers": {"cookie": "a=b", "accept": "application/json"},
            "body": {
                "text": "Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig",
                "list": [1, "sk-ant-REDACTED", {"password": ["x"]}]
            }
        });

        let f = filter();
        let once = f.filter(&input);
        let twice = f.filter(&once.filtered);

        assert_eq!(once.filtered, twice.filtered);
        assert!(!twice.has_changes);
        assert!(twice.sensitive_field_paths.is_empty());
    }

    #[test]
    fn test_does_not_mutate_input() {
        let input = json!({"password": "hunter2"});
        let snapshot = input.clone();

        let _ = filter().filter(&input);

        assert_eq!(input, snapshot);
    }

    #[test]
    fn test_clean_value_reports_no_changes() {
        let input = json!({"model": "claude-3-5-sonnet", "max_tokens": 1024, "stream": false});
        let result = filter().filter(&input);

        assert!(!result.has_changes);
        assert_eq!(result.filtered, input);
    }

    #[test]
    fn test_filter_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer sk-abc".to_string());
        headers.insert("content-type".to_string(), "application/json".to_string());

        let filtered = filter().filter_headers(&headers);

        assert_eq!(filtered["authorization"], "[REDACTED]");
        assert_eq!(filtered["content-type"], "application/json");
    }

    #[test]
    fn test_scrub_stack_trace() {
        let stack = "Error: boom\n    at handler (/home/alice/gateway/src/pipeline.js:42:7)\n    at run (/opt/app/node_modules/lib/index.js:3:1)";

        let f = filter();
        let scrubbed = f.scrub_stack_trace(stack);

        assert!(!scrubbed.contains("alice"));
        assert!(!scrubbed.contains("/opt/app"));
        assert!(scrubbed.contains("~/gateway/src/pipeline.js:42:7"));
        assert!(scrubbed.contains("(.../index.js:3:1)"));
        assert_eq!(f.scrub_stack_trace(&scrubbed), scrubbed);
    }

    #[test]
    fn test_extra_value_patterns() {
        let config = FilterConfig {
            extra_value_patterns: vec![r"internal-[0-9]{4}".to_string()],
            ..FilterConfig::default()
        };
        let f = SensitiveDataFilter::new(&config).unwrap();

        assert_eq!(f.filter_text("ticket internal-1234 open"), "ticket [REDACTED] open");
    }

    #[test]
    fn test_filter_error_scrubs_message_and_stack() {
        let error = RecordedError::new("auth failed for sk-live-0123456789abcdefgh")
            .with_stack("at /Users/bob/work/main.rs:1");

        let filtered = filter().filter_error(&error);

        assert_eq!(filtered.message, "auth failed for [REDACTED]");
        assert_eq!(filtered.stack.as_deref(), Some("at ~/work/main.rs:1"));
    }
}
