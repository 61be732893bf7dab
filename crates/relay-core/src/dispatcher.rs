//! Envelope dispatch with bounded retry and escalation.
//!
//! One call to [`Dispatcher::dispatch`] is one logical dispatch: the inbound
//! envelope is logged, its receiver resolved, and the capability invoked
//! until it succeeds or the retry budget is spent. Every path ends in an
//! envelope, never an error. Failures travel back to the sender as
//! escalation envelopes that carry the failed envelope under
//! `context.original`.

use crate::audit_log::{AuditKind, AuditTrail};
use crate::capability_registry::{CapabilityRegistry, RegistryEntry};
use relay_proto::{CapabilityOutput, Envelope, Error, Intent, Result, Route, Status};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry and timeout settings applied to every dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Timeout for capabilities without their own override.
    pub capability_timeout: Option<Duration>,
    /// Fixed delay before each retry.
    pub retry_backoff: Option<Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            capability_timeout: None,
            retry_backoff: None,
        }
    }
}

/// Resolves receivers and invokes their capabilities.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, policy: DispatchPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Dispatches `envelope`, letting the capability or registry pick the
    /// next hop.
    pub async fn dispatch(&self, envelope: Envelope, audit: &AuditTrail) -> Envelope {
        self.dispatch_via(envelope, None, audit).await
    }

    /// Dispatches `envelope`, addressing a successful response to `next_hop`
    /// when one is given.
    ///
    /// Without an override the next hop is the route returned by the
    /// capability, then the registry default, then the sentinel.
    pub async fn dispatch_via(
        &self,
        mut envelope: Envelope,
        next_hop: Option<&Route>,
        audit: &AuditTrail,
    ) -> Envelope {
        if envelope.status() == Status::Failed {
            warn!(
                envelope_id = %envelope.id(),
                sender = %envelope.sender(),
                "Failed envelopes are terminal - not dispatching"
            );
            return envelope;
        }

        audit.record(AuditKind::Dispatched, &envelope);

        let entry = match self.registry.resolve(envelope.receiver()) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    envelope_id = %envelope.id(),
                    receiver = %envelope.receiver(),
                    sender = %envelope.sender(),
                    "Unknown receiver - escalating to sender"
                );
                return escalate(&envelope, Intent::error(), &err, audit);
            }
        };

        let mut attempt_retries = 0;
        loop {
            let attempt = self.invoke(entry, envelope.content()).await;
            match attempt {
                Ok(output) => {
                    let route = next_hop
                        .cloned()
                        .or(output.route)
                        .or_else(|| entry.default_next_hop().cloned())
                        .unwrap_or(Route::Terminate);
                    let response = Envelope::reply(&envelope, output.content, &route);

                    debug!(
                        envelope_id = %envelope.id(),
                        response_id = %response.id(),
                        capability = %entry.name(),
                        next = %route,
                        retries = envelope.retries(),
                        "Capability succeeded"
                    );
                    audit.record(AuditKind::Emitted, &response);
                    return response;
                }
                Err(err) => {
                    attempt_retries += 1;
                    envelope.record_retry();

                    if attempt_retries > self.policy.max_retries {
                        warn!(
                            envelope_id = %envelope.id(),
                            capability = %entry.name(),
                            retries = envelope.retries(),
                            error = %err,
                            "Max retries reached - escalating to sender"
                        );
                        return escalate(&envelope, Intent::failure_notification(), &err, audit);
                    }

                    warn!(
                        envelope_id = %envelope.id(),
                        capability = %entry.name(),
                        retry = attempt_retries,
                        max_retries = self.policy.max_retries,
                        error = %err,
                        "Capability failed - retrying"
                    );
                    if let Some(backoff) = self.policy.retry_backoff {
                        tokio::time::sleep(backoff).await;
                    }
                    audit.record(AuditKind::Dispatched, &envelope);
                }
            }
        }
    }

    /// Runs one attempt, mapping failures and timeouts into the retryable
    /// error kinds.
    async fn invoke(&self, entry: &RegistryEntry, payload: &Value) -> Result<CapabilityOutput> {
        let execution = entry.capability().execute(payload);

        let result = match entry.timeout().or(self.policy.capability_timeout) {
            Some(after) => match tokio::time::timeout(after, execution).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Error::Timeout {
                        capability: entry.name().to_string(),
                        after,
                    });
                }
            },
            None => execution.await,
        };

        result.map_err(|e| Error::CapabilityFailure {
            capability: entry.name().to_string(),
            reason: e.reason().to_string(),
        })
    }
}

fn escalate(inbound: &Envelope, intent: Intent, error: &Error, audit: &AuditTrail) -> Envelope {
    let escalation = Envelope::escalation(inbound, intent, error);
    audit.record(AuditKind::Escalated, &escalation);
    escalation
}
