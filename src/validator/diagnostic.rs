//! Request-flow diagnostic
//!
//! Pushes a synthetic request through routing and execution. A successful
//! response is checked layer by layer; a failed execution is followed by a
//! diagnosis that calls each layer's `process` directly, outer to inner,
//! until one fails or turns out to be absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RoutingHeuristicsConfig;
use crate::events::{DebugNotification, NotificationBus};
use crate::pipeline::{Layer, LayerSlot, Pipeline, PipelineManager, PipelineRouter, PipelineSelector};
use crate::router::{classify_request, VirtualModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStage {
    Routing,
    Execution,
    ResponseValidation,
    Diagnosis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingOutcome {
    pub virtual_model: VirtualModel,
    pub candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub has_response: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structural check of the response from one layer's point of view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerCheck {
    pub layer: Layer,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStepStatus {
    Passed,
    Failed,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStep {
    pub layer: Layer,
    pub status: LayerStepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDiagnosis {
    pub pipeline_id: String,
    pub steps: Vec<LayerStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_layer: Option<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl LayerDiagnosis {
    pub fn is_healthy(&self) -> bool {
        self.failed_layer.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDiagnosticReport {
    /// Stages entered, in order
    pub stages: Vec<DiagnosticStage>,
    pub routing: RoutingOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_validation: Option<Vec<LayerCheck>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<LayerDiagnosis>,
    pub success: bool,
}

impl FlowDiagnosticReport {
    pub fn failed_layer(&self) -> Option<Layer> {
        self.diagnosis.as_ref().and_then(|d| d.failed_layer)
    }
}

/// Targeted advice for a failing layer
pub fn remediation_for(layer: Layer, absent: bool) -> String {
    if absent {
        return format!(
            "Layer '{}' is not connected; check that the pipeline assembly registers a {} module",
            layer, layer
        );
    }
    match layer {
        Layer::Server => {
            "Provider call failed; check the endpoint URL, API key and network reachability".to_string()
        }
        Layer::ServerCompatibility => {
            "Provider compatibility adaptation failed; check field mapping and unsupported parameters for this provider".to_string()
        }
        Layer::Protocol => {
            "Protocol conversion failed; check the request format against the target provider protocol".to_string()
        }
        Layer::Transformer => {
            "Request transformation failed; check model mapping and message normalization".to_string()
        }
    }
}

/// Invoke each layer in isolation, outer to inner, with the same input
///
/// Stops at the first layer that is absent or returns an error; layers
/// after it are never called.
pub async fn diagnose_pipeline(pipeline: &dyn Pipeline, input: &Value) -> LayerDiagnosis {
    let mut diagnosis = LayerDiagnosis {
        pipeline_id: pipeline.id().to_string(),
        steps: Vec::new(),
        failed_layer: None,
        error: None,
        remediation: None,
    };

    for layer in Layer::outer_to_inner() {
        let started = Instant::now();
        let processor = match pipeline.layer(layer) {
            LayerSlot::Present(processor) => processor,
            LayerSlot::Absent => {
                diagnosis.steps.push(LayerStep {
                    layer,
                    status: LayerStepStatus::Absent,
                    duration_ms: 0,
                    error: None,
                });
                diagnosis.failed_layer = Some(layer);
                diagnosis.error = Some(format!("layer '{}' is not connected", layer));
                diagnosis.remediation = Some(remediation_for(layer, true));
                break;
            }
        };

        match processor.process(input.clone()).await {
            Ok(_) => diagnosis.steps.push(LayerStep {
                layer,
                status: LayerStepStatus::Passed,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            }),
            Err(e) => {
                let message = format!("{:#}", e);
                diagnosis.steps.push(LayerStep {
                    layer,
                    status: LayerStepStatus::Failed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(message.clone()),
                });
                diagnosis.failed_layer = Some(layer);
                diagnosis.error = Some(message);
                diagnosis.remediation = Some(remediation_for(layer, false));
                break;
            }
        }
    }

    if let Some(layer) = diagnosis.failed_layer {
        tracing::warn!(
            pipeline_id = %diagnosis.pipeline_id,
            failed_layer = %layer,
            error = diagnosis.error.as_deref().unwrap_or_default(),
            "Layer diagnosis located a failure"
        );
    }

    diagnosis
}

/// Structure checks on a successful response, outer to inner
///
/// - server: a non-null JSON object without a top-level `error`
/// - serverCompatibility: a recognizable completion shape (`choices`,
///   `content` or `candidates`)
/// - protocol: that content is a non-empty array
/// - transformer: the caller-facing `model` is a string
pub fn validate_response_layers(response: &Value) -> Vec<LayerCheck> {
    Layer::outer_to_inner()
        .into_iter()
        .map(|layer| {
            let issues = layer_issues(layer, response);
            LayerCheck {
                layer,
                passed: issues.is_empty(),
                issues,
            }
        })
        .collect()
}

const CONTENT_FIELDS: [&str; 3] = ["choices", "content", "candidates"];

fn layer_issues(layer: Layer, response: &Value) -> Vec<String> {
    let Some(object) = response.as_object() else {
        return match layer {
            Layer::Server => vec!["response is not a JSON object".to_string()],
            _ => Vec::new(),
        };
    };

    let mut issues = Vec::new();
    match layer {
        Layer::Server => {
            if let Some(error) = object.get("error").filter(|e| !e.is_null()) {
                issues.push(format!("provider returned an error: {}", error));
            }
        }
        Layer::ServerCompatibility => {
            if !CONTENT_FIELDS.iter().any(|f| object.contains_key(*f)) {
                issues.push("response has none of choices/content/candidates".to_string());
            }
        }
        Layer::Protocol => {
            if let Some((field, value)) = CONTENT_FIELDS.iter().find_map(|f| object.get(*f).map(|v| (f, v))) {
                match value.as_array() {
                    Some(items) if !items.is_empty() => {}
                    Some(_) => issues.push(format!("'{}' is empty", field)),
                    None => issues.push(format!("'{}' is not an array", field)),
                }
            }
        }
        Layer::Transformer => {
            if !object.get("model").map_or(false, Value::is_string) {
                issues.push("response has no string 'model' field".to_string());
            }
        }
    }
    issues
}

/// End-to-end diagnostic over the live routing collaborators
pub struct RequestFlowDiagnostic {
    manager: Arc<dyn PipelineManager>,
    router: Arc<dyn PipelineRouter>,
    selector: Option<Arc<dyn PipelineSelector>>,
    heuristics: RoutingHeuristicsConfig,
    bus: NotificationBus,
}

impl RequestFlowDiagnostic {
    pub fn new(
        manager: Arc<dyn PipelineManager>,
        router: Arc<dyn PipelineRouter>,
        heuristics: RoutingHeuristicsConfig,
        bus: NotificationBus,
    ) -> Self {
        Self {
            manager,
            router,
            selector: None,
            heuristics,
            bus,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn PipelineSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub async fn run(&self, request: &Value) -> FlowDiagnosticReport {
        let mut report = FlowDiagnosticReport {
            stages: vec![DiagnosticStage::Routing],
            routing: self.route(request),
            execution: None,
            response_validation: None,
            diagnosis: None,
            success: false,
        };

        let Some(pipeline_id) = report.routing.selected_pipeline.clone() else {
            self.finish(&report, None);
            return report;
        };

        report.stages.push(DiagnosticStage::Execution);
        let Some(pipeline) = self.manager.pipeline(&pipeline_id) else {
            report.execution = Some(ExecutionOutcome {
                has_response: false,
                execution_time_ms: 0,
                error: Some(format!("pipeline '{}' is not registered", pipeline_id)),
            });
            self.finish(&report, Some(&pipeline_id));
            return report;
        };

        let started = Instant::now();
        let executed = pipeline.execute(request.clone()).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match executed {
            Ok(response) => {
                report.execution = Some(ExecutionOutcome {
                    has_response: true,
                    execution_time_ms,
                    error: None,
                });
                report.stages.push(DiagnosticStage::ResponseValidation);
                let checks = validate_response_layers(&response);
                report.success = checks.iter().all(|c| c.passed);
                report.response_validation = Some(checks);
            }
            Err(e) => {
                report.execution = Some(ExecutionOutcome {
                    has_response: false,
                    execution_time_ms,
                    error: Some(format!("{:#}", e)),
                });
                report.stages.push(DiagnosticStage::Diagnosis);
                report.diagnosis = Some(diagnose_pipeline(pipeline.as_ref(), request).await);
            }
        }

        self.finish(&report, Some(&pipeline_id));
        report
    }

    fn route(&self, request: &Value) -> RoutingOutcome {
        let virtual_model = classify_request(request, &self.heuristics);
        let candidates = self.router.candidates(virtual_model);

        if candidates.is_empty() {
            return RoutingOutcome {
                virtual_model,
                candidates,
                selected_pipeline: None,
                error: Some(format!("no pipelines available for virtual model '{}'", virtual_model)),
            };
        }

        let selected = match &self.selector {
            Some(selector) => selector.select(&candidates),
            None => candidates.first().cloned(),
        };
        let error = selected
            .is_none()
            .then(|| "load balancer selected no pipeline".to_string());

        RoutingOutcome {
            virtual_model,
            candidates,
            selected_pipeline: selected,
            error,
        }
    }

    fn finish(&self, report: &FlowDiagnosticReport, pipeline_id: Option<&str>) {
        let failed_layer = report.failed_layer().map(|l| l.as_str());
        crate::metrics::record_diagnosis(failed_layer);

        tracing::info!(
            pipeline_id = pipeline_id.unwrap_or("none"),
            virtual_model = %report.routing.virtual_model,
            success = report.success,
            failed_layer = failed_layer.unwrap_or("none"),
            "Request flow diagnostic completed"
        );

        self.bus.publish(DebugNotification::DiagnosisCompleted {
            pipeline_id: pipeline_id.map(str::to_string),
            success: report.success,
            failed_layer: failed_layer.map(str::to_string),
        });
    }

    /// Diagnose one pipeline directly, skipping routing and execution
    pub async fn diagnose(&self, pipeline_id: &str, input: &Value) -> Option<LayerDiagnosis> {
        let pipeline = self.manager.pipeline(pipeline_id)?;
        let diagnosis = diagnose_pipeline(pipeline.as_ref(), input).await;

        crate::metrics::record_diagnosis(diagnosis.failed_layer.map(|l| l.as_str()));
        self.bus.publish(DebugNotification::DiagnosisCompleted {
            pipeline_id: Some(pipeline_id.to_string()),
            success: diagnosis.is_healthy(),
            failed_layer: diagnosis.failed_layer.map(|l| l.as_str().to_string()),
        });
        Some(diagnosis)
    }
}
