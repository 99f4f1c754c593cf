//! Pipeline topology validation
//!
//! The routing table says which provider/model/key combinations should be
//! served; the pipeline manager says which pipelines exist. Validation diffs
//! the two id sets and, when they agree, checks that every live pipeline has
//! all four layers connected.

pub mod diagnostic;

pub use diagnostic::{
    diagnose_pipeline, remediation_for, validate_response_layers, DiagnosticStage, ExecutionOutcome,
    FlowDiagnosticReport, LayerCheck, LayerDiagnosis, LayerStep, LayerStepStatus, RequestFlowDiagnostic,
    RoutingOutcome,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{DebugError, Result};
use crate::events::{DebugNotification, NotificationBus};
use crate::pipeline::{Layer, PipelineManager, PipelineStatus, RoutingTable};
use crate::record::current_millis;

/// A pipeline the routing table expects to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedPipeline {
    pub pipeline_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub api_key_index: usize,
    /// Virtual models routing to this pipeline
    pub virtual_models: Vec<String>,
}

/// Snapshot of one live pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDebugInfo {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Layer -> connected
    pub layers: BTreeMap<Layer, bool>,
    pub missing_layers: Vec<Layer>,
}

impl PipelineDebugInfo {
    pub fn is_complete(&self) -> bool {
        self.missing_layers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationReport {
    pub expected: Vec<String>,
    pub live: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl ConfigurationReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureReport {
    pub pipelines: Vec<PipelineDebugInfo>,
    /// Ids of pipelines with at least one missing layer, in id order
    pub incomplete: Vec<String>,
}

impl ArchitectureReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub timestamp: u64,
    pub configuration: ConfigurationReport,
    /// Only computed when the configuration check passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<ArchitectureReport>,
    pub is_valid: bool,
}

pub struct PipelineValidator {
    routing: RoutingTable,
    bus: NotificationBus,
}

impl PipelineValidator {
    pub fn new(routing: RoutingTable, bus: NotificationBus) -> Self {
        Self { routing, bus }
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    /// Expected pipelines, de-duplicated by id and sorted
    pub fn expected_pipelines(&self) -> Vec<ExpectedPipeline> {
        let mut by_id: BTreeMap<String, ExpectedPipeline> = BTreeMap::new();

        for (virtual_model, targets) in &self.routing.routes {
            for target in targets {
                let id = target.expected_pipeline_id();
                let entry = by_id.entry(id.clone()).or_insert_with(|| ExpectedPipeline {
                    pipeline_id: id,
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    api_key_index: target.api_key_index,
                    virtual_models: Vec::new(),
                });
                if !entry.virtual_models.contains(virtual_model) {
                    entry.virtual_models.push(virtual_model.clone());
                }
            }
        }

        by_id.into_values().collect()
    }

    /// Diff the expected id set against the live one
    pub fn validate_configuration(&self, manager: &dyn PipelineManager) -> ConfigurationReport {
        let expected: BTreeSet<String> = self.expected_pipelines().into_iter().map(|p| p.pipeline_id).collect();
        let live: BTreeSet<String> = manager.pipeline_ids().into_iter().collect();

        ConfigurationReport {
            missing: expected.difference(&live).cloned().collect(),
            unexpected: live.difference(&expected).cloned().collect(),
            expected: expected.into_iter().collect(),
            live: live.into_iter().collect(),
        }
    }

    /// Layer connectivity of every live pipeline
    pub fn check_architecture(&self, manager: &dyn PipelineManager) -> ArchitectureReport {
        let mut ids = manager.pipeline_ids();
        ids.sort();

        let mut pipelines = Vec::with_capacity(ids.len());
        let mut incomplete = Vec::new();

        for id in ids {
            let Some(pipeline) = manager.pipeline(&id) else {
                // Listed but gone by the time we looked it up
                tracing::warn!(pipeline_id = %id, "Pipeline disappeared during validation");
                incomplete.push(id.clone());
                pipelines.push(PipelineDebugInfo {
                    pipeline_id: id,
                    status: PipelineStatus::Unknown,
                    provider: None,
                    model: None,
                    layers: Layer::ALL.iter().map(|l| (*l, false)).collect(),
                    missing_layers: Layer::ALL.to_vec(),
                });
                continue;
            };

            let layers: BTreeMap<Layer, bool> = Layer::ALL
                .iter()
                .map(|l| (*l, pipeline.layer(*l).is_present()))
                .collect();
            let missing_layers: Vec<Layer> = Layer::outer_to_inner()
                .into_iter()
                .filter(|l| !layers.get(l).copied().unwrap_or(false))
                .collect();

            if !missing_layers.is_empty() {
                incomplete.push(id.clone());
            }

            pipelines.push(PipelineDebugInfo {
                pipeline_id: id,
                status: pipeline.status(),
                provider: pipeline.provider().map(str::to_string),
                model: pipeline.model().map(str::to_string),
                layers,
                missing_layers,
            });
        }

        ArchitectureReport { pipelines, incomplete }
    }

    /// On-demand validation; never fails, the report says what is wrong
    pub fn validate(&self, manager: &dyn PipelineManager) -> ValidationReport {
        let configuration = self.validate_configuration(manager);
        let architecture = configuration
            .is_valid()
            .then(|| self.check_architecture(manager));

        let is_valid = configuration.is_valid() && architecture.as_ref().map_or(false, |a| a.is_complete());
        let result = if !configuration.is_valid() {
            "mismatch"
        } else if !is_valid {
            "incomplete"
        } else {
            "valid"
        };
        crate::metrics::record_validation(result);

        tracing::info!(
            expected = configuration.expected.len(),
            live = configuration.live.len(),
            missing = configuration.missing.len(),
            unexpected = configuration.unexpected.len(),
            is_valid = is_valid,
            "Pipeline validation completed"
        );

        self.bus.publish(DebugNotification::ValidationCompleted {
            is_valid,
            pipeline_count: configuration.live.len(),
        });

        ValidationReport {
            timestamp: current_millis(),
            configuration,
            architecture,
            is_valid,
        }
    }

    /// Startup gate: the caller should abort when this returns an error
    pub fn validate_on_startup(&self, manager: &dyn PipelineManager) -> Result<ValidationReport> {
        let report = self.validate(manager);

        let failure = if !report.configuration.is_valid() {
            Some(DebugError::ConfigurationMismatch {
                missing: report.configuration.missing.clone(),
                unexpected: report.configuration.unexpected.clone(),
            })
        } else {
            report
                .architecture
                .as_ref()
                .and_then(|a| a.pipelines.iter().find(|p| !p.is_complete()))
                .map(|p| DebugError::ArchitectureIncomplete {
                    pipeline_id: p.pipeline_id.clone(),
                    missing_layers: p.missing_layers.iter().map(|l| l.as_str().to_string()).collect(),
                })
        };

        match failure {
            Some(err) => {
                tracing::error!(error = %err, "Pipeline validation failed at startup");
                self.bus.publish(DebugNotification::ValidationFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
            None => Ok(report),
        }
    }
}
