//! Structural JSON diff used to compare original and replayed responses

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ReplayedExecution;
use crate::record::RequestRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    Added,
    Removed,
    Modified,
    Timing,
    Error,
}

impl DifferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifferenceKind::Added => "added",
            DifferenceKind::Removed => "removed",
            DifferenceKind::Modified => "modified",
            DifferenceKind::Timing => "timing",
            DifferenceKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difference {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_value: Option<Value>,
    pub kind: DifferenceKind,
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Field names or full paths to skip
    pub ignore_fields: Vec<String>,
    /// Numbers within this relative difference (percent) compare equal
    pub tolerance_percent: f64,
}

/// Field-by-field comparison of two JSON values
///
/// Paths are rendered `a.b[2].c`; a difference at the root has path `$`.
pub fn diff_values(original: &Value, replayed: &Value, options: &DiffOptions) -> Vec<Difference> {
    let mut out = Vec::new();
    walk(original, replayed, "", None, options, &mut out);
    out
}

fn walk(
    original: &Value,
    replayed: &Value,
    path: &str,
    last_key: Option<&str>,
    options: &DiffOptions,
    out: &mut Vec<Difference>,
) {
    if is_ignored(path, last_key, options) {
        return;
    }

    match (original, replayed) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, av) in a {
                let child = join_key(path, key);
                match b.get(key) {
                    Some(bv) => walk(av, bv, &child, Some(key), options, out),
                    None if !is_ignored(&child, Some(key), options) => out.push(Difference {
                        path: child,
                        original_value: Some(av.clone()),
                        replayed_value: None,
                        kind: DifferenceKind::Removed,
                    }),
                    None => {}
                }
            }
            for (key, bv) in b {
                if a.contains_key(key) {
                    continue;
                }
                let child = join_key(path, key);
                if !is_ignored(&child, Some(key), options) {
                    out.push(Difference {
                        path: child,
                        original_value: None,
                        replayed_value: Some(bv.clone()),
                        kind: DifferenceKind::Added,
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = format!("{}[{}]", path, i);
                match (a.get(i), b.get(i)) {
                    (Some(av), Some(bv)) => walk(av, bv, &child, last_key, options, out),
                    (Some(av), None) => out.push(Difference {
                        path: child,
                        original_value: Some(av.clone()),
                        replayed_value: None,
                        kind: DifferenceKind::Removed,
                    }),
                    (None, Some(bv)) => out.push(Difference {
                        path: child,
                        original_value: None,
                        replayed_value: Some(bv.clone()),
                        kind: DifferenceKind::Added,
                    }),
                    (None, None) => {}
                }
            }
        }
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            if !within_tolerance(a, b, options.tolerance_percent) {
                out.push(modified(path, original, replayed));
            }
        }
        _ => {
            if original != replayed {
                out.push(modified(path, original, replayed));
            }
        }
    }
}

fn modified(path: &str, original: &Value, replayed: &Value) -> Difference {
    Difference {
        path: if path.is_empty() { "$".to_string() } else { path.to_string() },
        original_value: Some(original.clone()),
        replayed_value: Some(replayed.clone()),
        kind: DifferenceKind::Modified,
    }
}

/// Relative difference of `a` and `b` is at most `tolerance_percent`
pub fn within_tolerance(a: f64, b: f64, tolerance_percent: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() / scale * 100.0 <= tolerance_percent
}

/// Coarse side-by-side summary of a recorded request and its replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeDiff {
    /// Response bodies are byte-for-byte equal JSON
    pub response_same: bool,
    /// Both succeeded, or both failed with the same message
    pub error_same: bool,
    pub module_sequence_same: bool,
    /// Original minus replayed layer count
    pub module_count_diff: i32,
    /// Original minus replayed duration; `None` when the original never completed
    pub duration_diff_ms: Option<i64>,
}

pub fn compare_outcomes(original: &RequestRecord, replayed: &ReplayedExecution) -> OutcomeDiff {
    let original_modules = original.pipeline.module_names();

    OutcomeDiff {
        response_same: original.response.as_ref().map(|r| &r.body) == replayed.response.as_ref(),
        error_same: original.error.as_ref().map(|e| e.message.as_str())
            == replayed.error.as_ref().map(|e| e.message.as_str()),
        module_sequence_same: original_modules
            .iter()
            .copied()
            .eq(replayed.module_names.iter().map(String::as_str)),
        module_count_diff: original_modules.len() as i32 - replayed.module_names.len() as i32,
        duration_diff_ms: original
            .duration_ms()
            .map(|d| d as i64 - replayed.duration as i64),
    }
}

fn is_ignored(path: &str, last_key: Option<&str>, options: &DiffOptions) -> bool {
    !path.is_empty()
        && options
            .ignore_fields
            .iter()
            .any(|f| f == path || last_key == Some(f.as_str()))
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
    use crate::record::fixtures::sample_record;
    use crate::record::RecordedError;
    use serde_json::json;

    fn opts() -> DiffOptions {
        DiffOptions::default()
    }

    #[test]
    fn test_identical_values_have_no_diff() {
        let v = json!({"a": [1, {"b": "c"}], "d": null});
        assert!(diff_values(&v, &v, &opts()).is_empty());
    }

    #[test]
    fn test_added_key() {
        let a = json!({"a": {"b": 1}});
        let b = json!({"a": {"b": 1, "c": 2}});

        let diffs = diff_values(&a, &b, &opts());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "a.c");
        assert_eq!(diffs[0].kind, DifferenceKind::Added);
        assert_eq!(diffs[0].replayed_value, Some(json!(2)));
    }

    #[test]
    fn test_removed_and_modified() {
        let a = json!({"x": 1, "y": [1, 2, 3]});
        let b = json!({"y": [1, 5]});

        let diffs = diff_values(&a, &b, &opts());
        let summary: Vec<_> = diffs.iter().map(|d| (d.path.as_str(), d.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("x", DifferenceKind::Removed),
                ("y[1]", DifferenceKind::Modified),
                ("y[2]", DifferenceKind::Removed),
            ]
        );
    }

    #[test]
    fn test_ignore_by_key_or_path() {
        let a = json!({"id": "1", "usage": {"total": 5}, "choices": [{"id": "x"}]});
        let b = json!({"id": "2", "usage": {"total": 9}, "choices": [{"id": "y"}]});

        let options = DiffOptions {
            ignore_fields: vec!["id".to_string(), "usage.total".to_string()],
            ..opts()
        };
        assert!(diff_values(&a, &b, &options).is_empty());
    }

    #[test]
    fn test_numeric_tolerance() {
        let a = json!({"tokens": 100});
        let b = json!({"tokens": 108});

        assert_eq!(diff_values(&a, &b, &opts()).len(), 1);

        let tolerant = DiffOptions {
            tolerance_percent: 10.0,
            ..opts()
        };
        assert!(diff_values(&a, &b, &tolerant).is_empty());
    }

    #[test]
    fn test_compare_outcomes() {
        let original = sample_record("r1", 8080, "s1");
        let mut replayed = ReplayedExecution {
            pipeline_id: original.pipeline.id.clone(),
            response: original.response.as_ref().map(|r| r.body.clone()),
            error: None,
            duration: 100,
            module_names: vec!["transformer".to_string(), "server".to_string()],
            timestamp: 0,
        };

        let same = compare_outcomes(&original, &replayed);
        assert!(same.response_same && same.error_same && same.module_sequence_same);
        assert_eq!(same.module_count_diff, 0);
        assert_eq!(same.duration_diff_ms, Some(20));

        replayed.response = None;
        replayed.error = Some(RecordedError::new("boom"));
        replayed.module_names.pop();
        let changed = compare_outcomes(&original, &replayed);
        assert!(!changed.response_same && !changed.error_same && !changed.module_sequence_same);
        assert_eq!(changed.module_count_diff, 1);
    }

    #[test]
    fn test_root_scalar_change() {
        let diffs = diff_values(&json!("a"), &json!("b"), &opts());
        assert_eq!(diffs[0].path, "$");
    }
}
