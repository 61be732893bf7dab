//! Pipeline driver.
//!
//! The driver feeds the latest envelope back into the dispatcher until the
//! pipeline reaches the `Final` sentinel, an escalation comes back, the
//! dispatch ceiling is hit, or the run is cancelled. One run is strictly
//! sequential; independent runs may share a registry and execute
//! concurrently.

use crate::audit_log::{AuditKind, AuditLog, AuditRecord, AuditTrail, RunId};
use crate::capability_registry::CapabilityRegistry;
use crate::config::RelayConfig;
use crate::dispatcher::{DispatchPolicy, Dispatcher};
use relay_proto::{Envelope, Error, Intent, Result, Route, Status};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Retries allowed per dispatch before escalating.
    pub max_retries: u32,
    /// Total dispatches allowed in the run, across all envelopes.
    pub dispatch_ceiling: u32,
    /// Timeout for capabilities without their own override.
    pub capability_timeout: Option<Duration>,
    /// Fixed delay before each retry.
    pub retry_backoff: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            dispatch_ceiling: 100,
            capability_timeout: None,
            retry_backoff: None,
        }
    }
}

impl RunConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dispatch_ceiling(mut self, dispatch_ceiling: u32) -> Self {
        self.dispatch_ceiling = dispatch_ceiling;
        self
    }

    pub fn with_capability_timeout(mut self, timeout: Duration) -> Self {
        self.capability_timeout = Some(timeout);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Returns the per-dispatch part of these settings.
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_retries: self.max_retries,
            capability_timeout: self.capability_timeout,
            retry_backoff: self.retry_backoff,
        }
    }
}

/// How receivers are chosen between dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Ordered stage names. Each response is addressed to the stage after
    /// the one that produced it, and the last stage hands off to `Final`.
    Static(Vec<String>),
    /// Each response already names its receiver.
    Dynamic,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Static(chain) => write!(f, "static[{}]", chain.join(" -> ")),
            RunMode::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Reason a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The latest envelope is addressed to `Final`.
    Completed,
    /// A dispatch produced a terminal escalation.
    Escalated,
    /// The dispatch ceiling was exceeded.
    Exhausted,
    /// Cancelled between dispatches.
    Cancelled,
}

impl RunOutcome {
    /// Returns the exit code for this outcome.
    ///
    /// - 0: completed
    /// - 1: escalated
    /// - 2: dispatch ceiling exceeded
    /// - 130: cancelled (SIGINT = 128 + 2)
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Escalated => 1,
            RunOutcome::Exhausted => 2,
            RunOutcome::Cancelled => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Escalated => "escalated",
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation flag for one run, checked only between
/// dispatches.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a finished run hands back to its caller.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    /// The latest envelope of the run.
    pub final_envelope: Envelope,
    /// Records appended by this run, in dispatch order.
    pub audit: Vec<AuditRecord>,
    /// Logical dispatches performed (retries not counted).
    pub dispatches: u32,
    /// Every envelope handed to the dispatcher, in dispatch order.
    pub history: Vec<Envelope>,
}

impl PipelineRun {
    /// Returns the receivers of every envelope that entered the dispatcher.
    pub fn dispatched_receivers(&self) -> Vec<&str> {
        self.audit
            .iter()
            .filter(|r| r.kind == AuditKind::Dispatched)
            .map(|r| r.receiver.as_str())
            .collect()
    }

    /// Returns the ancestors of the final envelope, newest first.
    pub fn causal_chain(&self) -> Vec<Envelope> {
        self.final_envelope.causal_chain(&self.history)
    }

    /// Converts the run into its final envelope, surfacing ceiling
    /// exhaustion and cancellation as errors.
    ///
    /// An escalated run still yields its `FAILED` envelope: escalations are
    /// answers addressed to the sender, not errors of the driver.
    pub fn into_result(self) -> Result<Envelope> {
        match self.outcome {
            RunOutcome::Completed | RunOutcome::Escalated => Ok(self.final_envelope),
            RunOutcome::Exhausted => Err(Error::PipelineExhausted {
                ceiling: self.dispatches,
            }),
            RunOutcome::Cancelled => Err(Error::Cancelled {
                dispatches: self.dispatches,
            }),
        }
    }
}

/// Drives dispatches from an initial envelope to a terminal one.
#[derive(Debug)]
pub struct Pipeline {
    dispatcher: Dispatcher,
    config: RunConfig,
    audit_log: Option<Arc<AuditLog>>,
}

impl Pipeline {
    pub fn new(registry: Arc<CapabilityRegistry>, config: RunConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry, config.policy()),
            config,
            audit_log: None,
        }
    }

    /// Creates a pipeline from the dispatch section of a configuration file.
    pub fn from_config(registry: Arc<CapabilityRegistry>, config: &RelayConfig) -> Self {
        Self::new(registry, config.run_config())
    }

    /// Appends every run's records to `log` instead of a private log.
    pub fn with_shared_audit(mut self, log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(log);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Builds the initial envelope and runs the pipeline.
    ///
    /// Fails only if the initial envelope is invalid; every runtime failure
    /// is reported through [`PipelineRun::outcome`].
    pub async fn run(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        intent: impl Into<Intent>,
        content: impl Into<Value>,
        mode: RunMode,
    ) -> Result<PipelineRun> {
        let initial = Envelope::new(sender, receiver, intent, content)?;
        Ok(self.run_envelope(initial, mode).await)
    }

    /// Runs the pipeline starting from an already built envelope.
    pub async fn run_envelope(&self, initial: Envelope, mode: RunMode) -> PipelineRun {
        self.run_envelope_with(initial, mode, &CancelHandle::new()).await
    }

    /// Runs the pipeline, stopping before the next dispatch once `cancel`
    /// is set.
    ///
    /// The handle affects only this run; other runs of the same pipeline
    /// keep going.
    pub async fn run_envelope_with(
        &self,
        initial: Envelope,
        mode: RunMode,
        cancel: &CancelHandle,
    ) -> PipelineRun {
        let trail = match &self.audit_log {
            Some(log) => AuditTrail::shared(Arc::clone(log)),
            None => AuditTrail::new(),
        };
        let ceiling = self.config.dispatch_ceiling;

        info!(
            run_id = %trail.run_id(),
            sender = %initial.sender(),
            receiver = %initial.receiver(),
            mode = %mode,
            ceiling,
            "Starting pipeline run"
        );

        if let RunMode::Static(chain) = &mode
            && chain.first().map(String::as_str) != Some(initial.receiver())
        {
            warn!(
                receiver = %initial.receiver(),
                first_stage = ?chain.first(),
                "Initial receiver is not the first stage of the static chain"
            );
        }

        let mut current = initial;
        let mut dispatches = 0;
        let mut history = Vec::new();

        let outcome = loop {
            if current.status() == Status::Failed {
                break RunOutcome::Escalated;
            }
            if current.route().is_terminal() {
                break RunOutcome::Completed;
            }
            if cancel.is_cancelled() {
                warn!(dispatches, "Run cancelled - stopping before next dispatch");
                break RunOutcome::Cancelled;
            }
            if dispatches >= ceiling {
                warn!(
                    ceiling,
                    receiver = %current.receiver(),
                    "Dispatch ceiling reached - stopping run"
                );
                let exhausted = Envelope::escalation(
                    &current,
                    Intent::pipeline_exhausted(),
                    &Error::PipelineExhausted { ceiling },
                );
                trail.record(AuditKind::Escalated, &exhausted);
                current = exhausted;
                break RunOutcome::Exhausted;
            }

            let next_hop = match &mode {
                RunMode::Static(chain) => Some(static_hop(chain, dispatches)),
                RunMode::Dynamic => None,
            };

            debug!(
                dispatch = dispatches + 1,
                receiver = %current.receiver(),
                next_hop = ?next_hop.as_ref().map(Route::receiver),
                "Dispatching"
            );
            history.push(current.clone());
            current = self
                .dispatcher
                .dispatch_via(current, next_hop.as_ref(), &trail)
                .await;
            dispatches += 1;
        };

        info!(
            run_id = %trail.run_id(),
            outcome = %outcome,
            dispatches,
            final_receiver = %current.receiver(),
            "Pipeline run finished"
        );

        PipelineRun {
            run_id: trail.run_id(),
            outcome,
            final_envelope: current,
            audit: trail.records(),
            dispatches,
            history,
        }
    }
}

/// Receiver for the response of the `stage`-th dispatch of a static chain.
fn static_hop(chain: &[String], stage: u32) -> Route {
    chain
        .get(stage as usize + 1)
        .map_or(Route::Terminate, |name| Route::to(name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCapability;
    use relay_proto::{Capability, FINAL};
    use serde_json::json;

    fn registry(caps: &[(&str, &Arc<ScriptedCapability>)]) -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        for (name, cap) in caps {
            registry
                .register(*name, Arc::clone(cap) as Arc<dyn Capability>)
                .unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn test_static_hop_walks_chain_then_final() {
        let chain = vec!["Intake".to_string(), "Transform".to_string()];
        assert_eq!(static_hop(&chain, 0), Route::to("Transform"));
        assert_eq!(static_hop(&chain, 1), Route::Terminate);
        assert_eq!(static_hop(&chain, 7), Route::Terminate);
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Escalated.exit_code(), 1);
        assert_eq!(RunOutcome::Exhausted.exit_code(), 2);
        assert_eq!(RunOutcome::Cancelled.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_static_chain_overrides_capability_routes() {
        let intake = Arc::new(ScriptedCapability::routing_to("Elsewhere"));
        let transform = Arc::new(ScriptedCapability::always_succeed(json!("done")));
        let pipeline = Pipeline::new(
            registry(&[("Intake", &intake), ("Transform", &transform)]),
            RunConfig::default(),
        );

        let run = pipeline
            .run(
                "User",
                "Intake",
                "parse_customer_intent",
                "x",
                RunMode::Static(vec!["Intake".into(), "Transform".into()]),
            )
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.dispatches, 2);
        assert_eq!(run.final_envelope.receiver(), "Final");
        assert_eq!(run.final_envelope.content(), &json!("done"));
        assert_eq!(run.dispatched_receivers(), vec!["Intake", "Transform"]);
    }

    #[tokio::test]
    async fn test_escalation_stops_run() {
        let intake = Arc::new(ScriptedCapability::routing_to("Transform"));
        let transform = Arc::new(ScriptedCapability::always_fail("schema mismatch"));
        let pipeline = Pipeline::new(
            registry(&[("Intake", &intake), ("Transform", &transform)]),
            RunConfig::default().with_max_retries(1),
        );

        let run = pipeline
            .run("User", "Intake", "go", "x", RunMode::Dynamic)
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Escalated);
        assert_eq!(run.dispatches, 2);
        assert_eq!(transform.invocations(), 2);
        assert_eq!(run.final_envelope.status(), Status::Failed);
        // escalations go back to whoever sent the failed envelope
        assert_eq!(run.final_envelope.receiver(), "Intake");

        let envelope = run.into_result().unwrap();
        assert_eq!(envelope.intent().as_str(), Intent::FAILURE_NOTIFICATION);
    }

    #[tokio::test]
    async fn test_initial_envelope_to_final_completes_without_dispatch() {
        let pipeline = Pipeline::new(Arc::new(CapabilityRegistry::new()), RunConfig::default());

        let run = pipeline
            .run("User", "Final", "noop", Value::Null, RunMode::Dynamic)
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.dispatches, 0);
        assert!(run.audit.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_initial_envelope() {
        let pipeline = Pipeline::new(Arc::new(CapabilityRegistry::new()), RunConfig::default());
        let err = pipeline
            .run("", "Intake", "go", "x", RunMode::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_run_dispatches_nothing() {
        let intake = Arc::new(ScriptedCapability::always_succeed(json!(1)));
        let pipeline = Pipeline::new(registry(&[("Intake", &intake)]), RunConfig::default());
        let cancel = CancelHandle::new();
        cancel.cancel();

        let initial = Envelope::new("User", "Intake", "go", "x").unwrap();
        let run = pipeline
            .run_envelope_with(initial, RunMode::Dynamic, &cancel)
            .await;

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.dispatches, 0);
        assert_eq!(intake.invocations(), 0);
        assert_eq!(run.final_envelope.status(), Status::Pending);
        assert!(matches!(
            run.into_result(),
            Err(Error::Cancelled { dispatches: 0 })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_affect_later_runs() {
        let intake = Arc::new(ScriptedCapability::always_succeed(json!(1)));
        let pipeline = Pipeline::new(registry(&[("Intake", &intake)]), RunConfig::default());
        let cancel = CancelHandle::new();
        cancel.cancel();

        let initial = Envelope::new("User", "Intake", "go", "x").unwrap();
        let cancelled = pipeline
            .run_envelope_with(initial, RunMode::Dynamic, &cancel)
            .await;
        assert_eq!(cancelled.outcome, RunOutcome::Cancelled);

        let run = pipeline
            .run("User", "Intake", "go", "x", RunMode::Dynamic)
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.dispatches, 1);
        assert_eq!(intake.invocations(), 1);
    }

    #[tokio::test]
    async fn test_history_resolves_full_causal_chain() {
        let a = Arc::new(ScriptedCapability::routing_to("B"));
        let b = Arc::new(ScriptedCapability::routing_to("C"));
        let c = Arc::new(ScriptedCapability::routing_to(FINAL));
        let pipeline = Pipeline::new(
            registry(&[("A", &a), ("B", &b), ("C", &c)]),
            RunConfig::default(),
        );

        let run = pipeline
            .run("User", "A", "go", "x", RunMode::Dynamic)
            .await
            .unwrap();

        assert_eq!(run.history.len(), 3);
        let receivers: Vec<&str> = run.history.iter().map(Envelope::receiver).collect();
        assert_eq!(receivers, vec!["A", "B", "C"]);

        let chain: Vec<String> = run
            .causal_chain()
            .iter()
            .map(|e| e.receiver().to_string())
            .collect();
        assert_eq!(chain, vec!["C", "B", "A"]);
    }
}
