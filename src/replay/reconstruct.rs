//! Rebuilding a runnable pipeline from a stored record

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::pipeline::{
    BlueprintModule, Layer, LayerProcessor, LayerSlot, Pipeline, PipelineBlueprint, PipelineFactory,
    PipelineManager,
};
use crate::record::{RecordedError, RequestRecord};

/// Derive the blueprint of the pipeline that served `record`
pub fn blueprint_from_record(record: &RequestRecord) -> PipelineBlueprint {
    PipelineBlueprint {
        pipeline_id: record.pipeline.id.clone(),
        provider: record.pipeline.provider.clone(),
        model: record.pipeline.model.clone(),
        modules: record
            .pipeline
            .modules
            .iter()
            .map(|m| BlueprintModule {
                name: m.module_name.clone(),
                metadata: m.metadata.clone(),
                recorded_output: m.output.clone(),
                recorded_error: m.error.clone(),
            })
            .collect(),
        recorded_response: record.response.as_ref().map(|r| r.body.clone()),
        recorded_error: record.error.clone(),
    }
}

fn to_anyhow(error: &RecordedError) -> anyhow::Error {
    match &error.code {
        Some(code) => anyhow::anyhow!("{} ({})", error.message, code),
        None => anyhow::anyhow!("{}", error.message),
    }
}

/// Layer stand-in answering with what the layer produced at record time
struct RecordedLayer {
    output: Option<Value>,
    error: Option<RecordedError>,
}

#[async_trait]
impl LayerProcessor for RecordedLayer {
    async fn process(&self, _input: Value) -> anyhow::Result<Value> {
        if let Some(error) = &self.error {
            return Err(to_anyhow(error));
        }
        Ok(self.output.clone().unwrap_or(Value::Null))
    }
}

/// Offline pipeline that replays the recorded outcome
pub struct RecordedPipeline {
    blueprint: PipelineBlueprint,
}

impl RecordedPipeline {
    pub fn new(blueprint: PipelineBlueprint) -> Self {
        Self { blueprint }
    }
}

#[async_trait]
impl Pipeline for RecordedPipeline {
    fn id(&self) -> &str {
        &self.blueprint.pipeline_id
    }

    async fn execute(&self, _request: Value) -> anyhow::Result<Value> {
        if let Some(error) = &self.blueprint.recorded_error {
            return Err(to_anyhow(error));
        }
        self.blueprint
            .recorded_response
            .clone()
            .ok_or_else(|| anyhow::anyhow!("record has no response to replay"))
    }

    fn layer(&self, layer: Layer) -> LayerSlot {
        self.blueprint
            .modules
            .iter()
            .rev()
            .find(|m| m.name.parse::<Layer>().ok() == Some(layer))
            .map_or(LayerSlot::Absent, |m| {
                LayerSlot::Present(Arc::new(RecordedLayer {
                    output: m.recorded_output.clone(),
                    error: m.recorded_error.clone(),
                }))
            })
    }

    fn provider(&self) -> Option<&str> {
        Some(&self.blueprint.provider)
    }

    fn model(&self) -> Option<&str> {
        Some(&self.blueprint.model)
    }

    fn module_names(&self) -> Vec<String> {
        self.blueprint.modules.iter().map(|m| m.name.clone()).collect()
    }
}

/// Prefers the live pipeline with the recorded id; falls back to
/// [`RecordedPipeline`] for offline replay
#[derive(Default)]
pub struct DefaultPipelineFactory {
    manager: Option<Arc<dyn PipelineManager>>,
}

impl DefaultPipelineFactory {
    pub fn new(manager: Option<Arc<dyn PipelineManager>>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PipelineFactory for DefaultPipelineFactory {
    async fn build(&self, blueprint: &PipelineBlueprint) -> anyhow::Result<Arc<dyn Pipeline>> {
        if let Some(live) = self
            .manager
            .as_ref()
            .and_then(|m| m.pipeline(&blueprint.pipeline_id))
        {
            return Ok(live);
        }

        tracing::debug!(
            pipeline_id = %blueprint.pipeline_id,
            "No live pipeline, replaying from the recorded outcome"
        );
        Ok(Arc::new(RecordedPipeline::new(blueprint.clone())))
    }
}
