//! Collaborator traits for the gateway pipeline
//!
//! The debug subsystem never builds or routes requests itself. It talks to
//! the gateway through these traits: a black-box `Pipeline` with named layer
//! sub-objects, a manager listing live pipelines, a router and selector for
//! virtual models, and a factory used by replay.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::DebugError;
use crate::record::RecordedError;
use crate::router::VirtualModel;

/// Pipeline layers, from the client-facing side inwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Layer {
    Transformer,
    Protocol,
    ServerCompatibility,
    Server,
}

impl Layer {
    /// Request execution order
    pub const ALL: [Layer; 4] = [
        Layer::Transformer,
        Layer::Protocol,
        Layer::ServerCompatibility,
        Layer::Server,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Transformer => "transformer",
            Layer::Protocol => "protocol",
            Layer::ServerCompatibility => "serverCompatibility",
            Layer::Server => "server",
        }
    }

    /// Order used when validating responses and diagnosing failures
    pub fn outer_to_inner() -> [Layer; 4] {
        [
            Layer::Server,
            Layer::ServerCompatibility,
            Layer::Protocol,
            Layer::Transformer,
        ]
    }
}

impl std::str::FromStr for Layer {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "transformer" => Ok(Layer::Transformer),
            "protocol" => Ok(Layer::Protocol),
            "servercompatibility" => Ok(Layer::ServerCompatibility),
            "server" => Ok(Layer::Server),
            _ => Err(DebugError::Config(format!("Invalid layer: {}", s))),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One layer of a pipeline, invocable in isolation
#[async_trait]
pub trait LayerProcessor: Send + Sync {
    async fn process(&self, input: Value) -> anyhow::Result<Value>;
}

/// A layer that may or may not be wired into a pipeline
#[derive(Clone)]
pub enum LayerSlot {
    Present(Arc<dyn LayerProcessor>),
    Absent,
}

impl LayerSlot {
    pub fn is_present(&self) -> bool {
        matches!(self, LayerSlot::Present(_))
    }

    pub fn processor(&self) -> Option<&Arc<dyn LayerProcessor>> {
        match self {
            LayerSlot::Present(p) => Some(p),
            LayerSlot::Absent => None,
        }
    }
}

impl std::fmt::Debug for LayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_present() { "Present" } else { "Absent" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Ready,
    Degraded,
    Failed,
    Unknown,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Ready => "ready",
            PipelineStatus::Degraded => "degraded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Unknown => "unknown",
        }
    }
}

/// A runnable gateway pipeline
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, request: Value) -> anyhow::Result<Value>;

    fn layer(&self, layer: Layer) -> LayerSlot;

    fn status(&self) -> PipelineStatus {
        PipelineStatus::Ready
    }

    fn provider(&self) -> Option<&str> {
        None
    }

    fn model(&self) -> Option<&str> {
        None
    }

    /// Names of the layers present, in execution order
    fn module_names(&self) -> Vec<String> {
        Layer::ALL
            .iter()
            .filter(|l| self.layer(**l).is_present())
            .map(|l| l.as_str().to_string())
            .collect()
    }
}

/// Live pipeline inventory
pub trait PipelineManager: Send + Sync {
    fn pipeline_ids(&self) -> Vec<String>;

    fn pipeline(&self, id: &str) -> Option<Arc<dyn Pipeline>>;
}

/// Candidate pipelines for a virtual model
pub trait PipelineRouter: Send + Sync {
    fn candidates(&self, virtual_model: VirtualModel) -> Vec<String>;
}

/// Picks one pipeline among candidates (load balancer)
pub trait PipelineSelector: Send + Sync {
    fn select(&self, candidates: &[String]) -> Option<String>;
}

/// Layer entry of a blueprint, taken from a recorded module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintModule {
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
    /// What the layer produced when the request was recorded
    #[serde(
        default,
        deserialize_with = "crate::record::present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_error: Option<RecordedError>,
}

/// What is needed to rebuild the pipeline that served a recorded request
///
/// The recorded outcome travels with the blueprint so a factory can answer
/// offline when no live pipeline with the same id exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineBlueprint {
    pub pipeline_id: String,
    pub provider: String,
    pub model: String,
    pub modules: Vec<BlueprintModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_error: Option<RecordedError>,
}

/// Builds runnable pipelines for replay
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self, blueprint: &PipelineBlueprint) -> anyhow::Result<Arc<dyn Pipeline>>;
}

/// One provider/model/key combination a virtual model may route to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_index: usize,
}

impl RouteTarget {
    /// Pipeline id this target is served by; an explicit id wins
    pub fn expected_pipeline_id(&self) -> String {
        match &self.pipeline_id {
            Some(id) => id.clone(),
            None => format!(
                "{}.{}.key{}",
                self.provider,
                self.model.as_deref().unwrap_or("default"),
                self.api_key_index
            ),
        }
    }
}

/// Virtual model name -> route targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<RouteTarget>>,
}

/// In-memory `PipelineManager`
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: DashMap<String, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pipeline: Arc<dyn Pipeline>) {
        self.pipelines.insert(pipeline.id().to_string(), pipeline);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.remove(id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl PipelineManager for PipelineRegistry {
    fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn pipeline(&self, id: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(id).map(|e| Arc::clone(e.value()))
    }
}
