//! # relay-proto
//!
//! Shared types, error definitions, and traits for the Relay dispatcher.
//!
//! This crate provides the foundational abstractions used across all Relay
//! crates, including:
//! - The message envelope and its status/intent metadata
//! - Routing outcomes and the reserved `Final`/`Router` names
//! - The capability contract invoked by the dispatcher
//! - Common error types

mod capability;
mod envelope;
mod error;
mod intent;
mod route;

pub use capability::{Capability, CapabilityError, CapabilityOutput, FnCapability};
pub use envelope::{
    CONTEXT_FAILURE, CONTEXT_ORIGINAL, CONTEXT_PREVIOUS, Context, Envelope, EnvelopeId, Status,
};
pub use error::{Error, Result};
pub use intent::Intent;
pub use route::{FINAL, ROUTER, Route};
