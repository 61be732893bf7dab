//! Test scenario definitions and execution.
//!
//! A scenario is a YAML document bundling a [`RelayConfig`], a script per
//! capability, and the envelope that starts the run:
//!
//! ```yaml
//! name: static_chain
//! config:
//!   pipeline: { mode: static, chain: [Intake, Transform] }
//! capabilities:
//!   Intake:
//!     script: [{ content: "parsed" }]
//!   Transform: {}
//! start: { sender: User, receiver: Intake, content: "x" }
//! ```

use super::scripted::{ScriptStep, ScriptedCapability};
use crate::capability_registry::CapabilityRegistry;
use crate::config::{ConfigError, RelayConfig};
use crate::pipeline::{Pipeline, PipelineRun};
use relay_proto::Capability;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A test scenario definition.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: RelayConfig,
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityScript>,
    pub start: StartEnvelope,
}

/// Script for one registered capability.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityScript {
    #[serde(default)]
    pub script: Vec<ScriptStep>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// The envelope that starts a scenario run.
#[derive(Debug, Clone, Deserialize)]
pub struct StartEnvelope {
    pub sender: String,
    pub receiver: String,
    #[serde(default = "default_intent")]
    pub intent: String,
    #[serde(default)]
    pub content: Value,
}

fn default_intent() -> String {
    "start".to_string()
}

impl Scenario {
    pub fn from_yaml(content: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(content).map_err(ConfigError::from)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::from)?;
        Self::from_yaml(&content)
    }
}

/// Failures that prevent a scenario from running at all.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Relay(#[from] relay_proto::Error),
}

/// Executes scenarios against scripted capabilities.
#[derive(Debug, Default)]
pub struct ScenarioRunner;

impl ScenarioRunner {
    pub fn new() -> Self {
        Self
    }

    /// Executes a scenario and returns the trace.
    pub async fn run(&self, scenario: &Scenario) -> Result<ExecutionTrace, ScenarioError> {
        for warning in scenario.config.validate()? {
            debug!(scenario = %scenario.name, "{}", warning);
        }

        let capabilities: BTreeMap<String, Arc<ScriptedCapability>> = scenario
            .capabilities
            .iter()
            .map(|(name, script)| {
                let mut capability = ScriptedCapability::new(script.script.clone());
                if let Some(ms) = script.delay_ms {
                    capability = capability.with_delay(Duration::from_millis(ms));
                }
                (name.clone(), Arc::new(capability))
            })
            .collect();

        let registry = CapabilityRegistry::from_config(
            &scenario.config,
            capabilities
                .iter()
                .map(|(name, cap)| (name.clone(), Arc::clone(cap) as Arc<dyn Capability>)),
        )?;

        let pipeline = Pipeline::from_config(Arc::new(registry), &scenario.config);
        let start = &scenario.start;
        let run = pipeline
            .run(
                start.sender.clone(),
                start.receiver.clone(),
                start.intent.clone(),
                start.content.clone(),
                scenario.config.run_mode(),
            )
            .await?;

        let invocations = capabilities
            .iter()
            .map(|(name, cap)| (name.clone(), cap.invocations()))
            .collect();

        Ok(ExecutionTrace { run, invocations })
    }
}

/// Trace of a scenario execution.
#[derive(Debug)]
pub struct ExecutionTrace {
    pub run: PipelineRun,
    /// Invocation count per capability name.
    pub invocations: BTreeMap<String, usize>,
}
