//! # relay-core
//!
//! Runtime for Relay pipelines.
//!
//! This crate provides:
//! - A registry mapping receiver names to capabilities
//! - The dispatcher, which runs one envelope with retries and escalation
//! - The pipeline driver for static chains and dynamic routing
//! - An append-only audit log with JSONL export
//! - YAML configuration loading

mod audit_log;
mod audit_recorder;
mod capability_registry;
mod config;
mod dispatcher;
mod pipeline;
pub mod testing;

pub use audit_log::{AuditKind, AuditLog, AuditRecord, AuditTrail, RunId};
pub use audit_recorder::{AuditRecorder, Line, read_lines};
pub use capability_registry::{CapabilityRegistry, RegistryEntry};
pub use config::{
    ConfigError, ConfigWarning, DispatchConfig, PipelineConfig, PipelineMode, RelayConfig,
    StageConfig,
};
pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use pipeline::{CancelHandle, Pipeline, PipelineRun, RunConfig, RunMode, RunOutcome};
