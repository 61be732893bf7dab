//! Testing utilities for deterministic pipeline tests.

pub mod scenario;
pub mod scripted;

pub use scenario::{
    CapabilityScript, ExecutionTrace, Scenario, ScenarioError, ScenarioRunner, StartEnvelope,
};
pub use scripted::{ScriptStep, ScriptedCapability};

use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
