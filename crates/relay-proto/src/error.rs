//! Error types shared by every Relay crate.

use std::time::Duration;

/// Errors raised while building envelopes, registering capabilities,
/// dispatching, or driving a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The receiver name is not present in the registry.
    #[error("Unknown receiver: {0}")]
    UnknownReceiver(String),

    /// The capability signaled a failure while executing.
    #[error("Capability '{capability}' failed: {reason}")]
    CapabilityFailure { capability: String, reason: String },

    /// The capability did not answer within its timeout.
    #[error("Capability '{capability}' timed out after {after:?}")]
    Timeout { capability: String, after: Duration },

    /// The run performed more dispatches than its ceiling allows.
    #[error("Pipeline exhausted: dispatch ceiling of {ceiling} exceeded")]
    PipelineExhausted { ceiling: u32 },

    /// The run was cancelled between dispatches.
    #[error("Pipeline cancelled after {dispatches} dispatches")]
    Cancelled { dispatches: u32 },

    /// An envelope failed construction-time validation.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A capability name was registered twice.
    #[error("Duplicate capability name: {0}")]
    DuplicateName(String),

    /// A capability tried to register under a name the router reserves.
    #[error("Reserved capability name: {0}")]
    ReservedName(String),
}

impl Error {
    /// Stable tag for this error kind, carried by escalation envelopes
    /// under `context.failure`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownReceiver(_) => "unknown_receiver",
            Error::CapabilityFailure { .. } => "capability_failure",
            Error::Timeout { .. } => "timeout",
            Error::PipelineExhausted { .. } => "pipeline_exhausted",
            Error::Cancelled { .. } => "cancelled",
            Error::InvalidEnvelope(_) => "invalid_envelope",
            Error::DuplicateName(_) => "duplicate_name",
            Error::ReservedName(_) => "reserved_name",
        }
    }

    /// Returns true if the dispatcher may retry after this error.
    ///
    /// Only capability failures and timeouts are recovered locally; every
    /// other kind terminates the dispatch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CapabilityFailure { .. } | Error::Timeout { .. })
    }
}

/// Result alias using the Relay [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
