use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RoutingHeuristicsConfig;
use crate::error::DebugError;

/// Virtual model buckets requests are routed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VirtualModel {
    Default,
    Background,
    Reasoning,
    LongContext,
    WebSearch,
}

impl VirtualModel {
    pub const ALL: [VirtualModel; 5] = [
        VirtualModel::Default,
        VirtualModel::Background,
        VirtualModel::Reasoning,
        VirtualModel::LongContext,
        VirtualModel::WebSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VirtualModel::Default => "default",
            VirtualModel::Background => "background",
            VirtualModel::Reasoning => "reasoning",
            VirtualModel::LongContext => "longContext",
            VirtualModel::WebSearch => "webSearch",
        }
    }
}

impl std::str::FromStr for VirtualModel {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "default" => Ok(VirtualModel::Default),
            "background" => Ok(VirtualModel::Background),
            "reasoning" | "think" => Ok(VirtualModel::Reasoning),
            "longcontext" => Ok(VirtualModel::LongContext),
            "websearch" => Ok(VirtualModel::WebSearch),
            _ => Err(DebugError::Config(format!("Invalid virtual model: {}", s))),
        }
    }
}

impl std::fmt::Display for VirtualModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pick the virtual model for a request
///
/// Checked in order: long context, background model, reasoning flag,
/// web-search tool. Anything else is `Default`.
pub fn classify_request(request: &Value, heuristics: &RoutingHeuristicsConfig) -> VirtualModel {
    if estimate_tokens(request) > heuristics.long_context_threshold {
        return VirtualModel::LongContext;
    }

    if let Some(model) = request.get("model").and_then(Value::as_str) {
        let model = model.to_lowercase();
        if heuristics
            .background_models
            .iter()
            .any(|marker| model.contains(&marker.to_lowercase()))
        {
            return VirtualModel::Background;
        }
    }

    if wants_thinking(request) {
        return VirtualModel::Reasoning;
    }

    if has_web_search_tool(request) {
        return VirtualModel::WebSearch;
    }

    VirtualModel::Default
}

/// Rough token count: characters of message, system and tool text over 4
pub fn estimate_tokens(request: &Value) -> usize {
    let chars: usize = ["messages", "system", "tools"]
        .iter()
        .filter_map(|field| request.get(*field))
        .map(text_len)
        .sum();
    chars / 4
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(text_len).sum(),
        Value::Object(map) => map.values().map(text_len).sum(),
        _ => 0,
    }
}

fn wants_thinking(request: &Value) -> bool {
    match request.get("thinking") {
        Some(Value::Bool(enabled)) => *enabled,
        Some(Value::Object(cfg)) => cfg.get("type").and_then(Value::as_str) != Some("disabled"),
        _ => false,
    }
}

fn has_web_search_tool(request: &Value) -> bool {
    request
        .get("tools")
        .and_then(Value::as_array)
        .map_or(false, |tools| {
            tools.iter().any(|tool| {
                ["name", "type"].iter().any(|field| {
                    tool.get(*field)
                        .and_then(Value::as_str)
                        .map_or(false, |s| s.contains("web_search"))
                })
            })
        })
}
