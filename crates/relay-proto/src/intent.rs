//! Intent tags describing why an envelope was sent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Symbolic tag describing an envelope's purpose.
///
/// Consumers may branch on any intent. The dispatcher only produces the
/// reserved ones below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intent(String);

impl Intent {
    /// Successful capability response.
    pub const PROCESSED_RESULT: &'static str = "processed_result";
    /// Escalation for a receiver that could not be resolved.
    pub const ERROR: &'static str = "error";
    /// Escalation after the retry budget was spent.
    pub const FAILURE_NOTIFICATION: &'static str = "failure_notification";
    /// Escalation emitted when a run hits its dispatch ceiling.
    pub const PIPELINE_EXHAUSTED: &'static str = "pipeline_exhausted";

    /// Creates a new intent tag.
    pub fn new(intent: impl Into<String>) -> Self {
        Self(intent.into())
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn processed_result() -> Self {
        Self::new(Self::PROCESSED_RESULT)
    }

    pub fn error() -> Self {
        Self::new(Self::ERROR)
    }

    pub fn failure_notification() -> Self {
        Self::new(Self::FAILURE_NOTIFICATION)
    }

    pub fn pipeline_exhausted() -> Self {
        Self::new(Self::PIPELINE_EXHAUSTED)
    }

    /// Returns true for intents the router uses on escalation envelopes.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::ERROR | Self::FAILURE_NOTIFICATION | Self::PIPELINE_EXHAUSTED
        )
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Intent {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Intent {
    fn from(s: String) -> Self {
        Self(s)
    }
}
