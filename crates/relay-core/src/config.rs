//! Configuration types for Relay pipelines.
//!
//! A configuration file tunes the dispatcher (retry budget, dispatch ceiling,
//! timeouts), picks the pipeline addressing mode, and attaches routing
//! defaults to named stages. Capabilities themselves are code and are
//! supplied when the registry is built.

use crate::pipeline::{RunConfig, RunMode};
use relay_proto::{FINAL, ROUTER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration for a Relay pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Retry and ceiling settings for the dispatcher.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Addressing mode and static chain.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-stage routing defaults, keyed by capability name.
    #[serde(default)]
    pub stages: HashMap<String, StageConfig>,

    /// Suppress all warnings (for CI environments).
    #[serde(default, rename = "_suppress_warnings")]
    pub suppress_warnings: bool,
}

impl RelayConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        Self::from_yaml(&content)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        debug!(
            mode = %config.pipeline.mode,
            max_retries = config.dispatch.max_retries,
            dispatch_ceiling = config.dispatch.dispatch_ceiling,
            stages = config.stages.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Validates the configuration and returns warnings.
    ///
    /// Errors are returned for settings that would make a run meaningless:
    /// a zero dispatch ceiling, a static pipeline without a chain, or a stage
    /// claiming a reserved name.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.dispatch.dispatch_ceiling == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatch.dispatch_ceiling".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let stage_names = self.stages.keys().map(String::as_str);
        let chain_names = self.pipeline.chain.iter().map(String::as_str);
        if let Some(name) = stage_names.chain(chain_names).find(|n| is_reserved(n)) {
            return Err(ConfigError::InvalidValue {
                field: "stages".to_string(),
                message: format!("'{name}' is reserved by the router"),
            });
        }

        if self.pipeline.mode == PipelineMode::Static && self.pipeline.chain.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.chain".to_string(),
                message: "static mode requires at least one stage".to_string(),
            });
        }

        let mut warnings = Vec::new();

        if self.suppress_warnings {
            return Ok(warnings);
        }

        if self.pipeline.mode == PipelineMode::Dynamic && !self.pipeline.chain.is_empty() {
            warnings.push(ConfigWarning::IgnoredField {
                field: "pipeline.chain".to_string(),
                reason: "dynamic mode routes by capability responses".to_string(),
            });
        }

        for name in &self.pipeline.chain {
            if !self.stages.contains_key(name) {
                warnings.push(ConfigWarning::UnknownStage {
                    field: "pipeline.chain".to_string(),
                    stage: name.clone(),
                });
            }
        }

        let mut configured: Vec<_> = self.stages.iter().collect();
        configured.sort_by_key(|(name, _)| name.as_str());
        for (name, stage) in configured {
            if let Some(next) = &stage.next
                && next != FINAL
                && !self.stages.contains_key(next)
            {
                warnings.push(ConfigWarning::UnknownStage {
                    field: format!("stages.{name}.next"),
                    stage: next.clone(),
                });
            }
        }

        Ok(warnings)
    }

    /// Projects the dispatch section into runtime settings.
    pub fn run_config(&self) -> RunConfig {
        let dispatch = &self.dispatch;
        RunConfig {
            max_retries: dispatch.max_retries,
            dispatch_ceiling: dispatch.dispatch_ceiling,
            capability_timeout: dispatch.capability_timeout_ms.map(Duration::from_millis),
            retry_backoff: dispatch.retry_backoff_ms.map(Duration::from_millis),
        }
    }

    /// Returns the configured addressing mode.
    pub fn run_mode(&self) -> RunMode {
        match self.pipeline.mode {
            PipelineMode::Static => RunMode::Static(self.pipeline.chain.clone()),
            PipelineMode::Dynamic => RunMode::Dynamic,
        }
    }
}

fn is_reserved(name: &str) -> bool {
    name == FINAL || name == ROUTER
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A stage name is referenced but has no `stages` entry.
    UnknownStage { field: String, stage: String },
    /// Field is present but has no effect in the selected mode.
    IgnoredField { field: String, reason: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::UnknownStage { field, stage } => {
                write!(f, "Warning [{}]: stage '{}' is not configured", field, stage)
            }
            ConfigWarning::IgnoredField { field, reason } => {
                write!(f, "Warning [{}]: Field ignored - {}", field, reason)
            }
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Retries allowed per dispatch before escalating.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Total dispatches allowed in one run.
    #[serde(default = "default_dispatch_ceiling")]
    pub dispatch_ceiling: u32,

    /// Default capability timeout in milliseconds.
    #[serde(default)]
    pub capability_timeout_ms: Option<u64>,

    /// Fixed delay between retries in milliseconds.
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_dispatch_ceiling() -> u32 {
    100
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dispatch_ceiling: default_dispatch_ceiling(),
            capability_timeout_ms: None,
            retry_backoff_ms: None,
        }
    }
}

/// Pipeline addressing mode as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Receivers are overwritten from a fixed chain.
    Static,
    /// Each response names its own receiver.
    #[default]
    Dynamic,
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineMode::Static => f.write_str("static"),
            PipelineMode::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Pipeline section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: PipelineMode,

    /// Ordered stage names for static mode.
    #[serde(default)]
    pub chain: Vec<String>,
}

/// Routing defaults for one capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    /// Receiver used when the capability does not pick one.
    #[serde(default)]
    pub next: Option<String>,

    /// Timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}
