//! The contract every routed processing stage implements.

use crate::Route;
use async_trait::async_trait;
use serde_json::Value;

/// Result of a successful capability execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityOutput {
    /// Payload handed to the next hop.
    pub content: Value,
    /// Next hop chosen by the capability, if it routes dynamically.
    pub route: Option<Route>,
}

impl CapabilityOutput {
    /// Creates an output that leaves routing to the registry or pipeline.
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            route: None,
        }
    }

    /// Addresses the output to the named capability.
    pub fn route_to(mut self, receiver: impl Into<String>) -> Self {
        self.route = Some(Route::to(receiver));
        self
    }

    /// Marks the output as the last step of the pipeline.
    pub fn terminate(mut self) -> Self {
        self.route = Some(Route::Terminate);
        self
    }
}

/// Failure signaled by a capability. The reason is opaque to the router.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct CapabilityError {
    reason: String,
}

impl CapabilityError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<String> for CapabilityError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl From<&str> for CapabilityError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

/// A named unit of work the dispatcher can invoke.
///
/// The dispatcher retries failed executions with the same payload, so an
/// implementation must be safe to run more than once for the same content.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Processes `payload` and returns the next payload, or signals failure.
    async fn execute(&self, payload: &Value) -> Result<CapabilityOutput, CapabilityError>;
}

/// Capability backed by a synchronous closure.
pub struct FnCapability<F> {
    f: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&Value) -> Result<CapabilityOutput, CapabilityError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(&Value) -> Result<CapabilityOutput, CapabilityError> + Send + Sync,
{
    async fn execute(&self, payload: &Value) -> Result<CapabilityOutput, CapabilityError> {
        (self.f)(payload)
    }
}
