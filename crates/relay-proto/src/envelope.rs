//! Message envelopes routed between capabilities.
//!
//! An envelope is built once and then only read. The single exception is the
//! retry counter, which the dispatcher bumps in place so that a retried
//! attempt keeps the identity of the envelope it retries.
//!
//! Provenance is one level deep: `context.original` and
//! `context.prev_message` hold a copy of the prior envelope whose own links
//! are reduced to id references. Older ancestors are found by id in the run
//! history (see [`Envelope::causal_chain`]).

use crate::route::{Route, ROUTER};
use crate::{Error, Intent, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Context key holding the envelope an escalation was raised for.
pub const CONTEXT_ORIGINAL: &str = "original";

/// Context key holding the envelope a response answers.
pub const CONTEXT_PREVIOUS: &str = "prev_message";

/// Context key holding the error kind on escalation envelopes.
pub const CONTEXT_FAILURE: &str = "failure";

/// Nested key-value provenance attached to an envelope.
pub type Context = serde_json::Map<String, Value>;

/// Unique envelope identifier, assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    Success,
    Failed,
}

impl Status {
    /// Returns true once the status can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed message with provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    created_at: DateTime<Utc>,
    sender: String,
    receiver: String,
    intent: Intent,
    content: Value,
    #[serde(default)]
    context: Context,
    status: Status,
    retries: u32,
}

impl Envelope {
    /// Builds a pending envelope with a fresh id.
    ///
    /// Fails with [`Error::InvalidEnvelope`] if `sender` or `receiver` is
    /// empty.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        intent: impl Into<Intent>,
        content: impl Into<Value>,
    ) -> Result<Self> {
        let sender = sender.into();
        let receiver = receiver.into();

        if sender.is_empty() {
            return Err(Error::InvalidEnvelope("sender must not be empty".into()));
        }
        if receiver.is_empty() {
            return Err(Error::InvalidEnvelope("receiver must not be empty".into()));
        }

        Ok(Self::stamp(
            sender,
            receiver,
            intent.into(),
            content.into(),
            Context::new(),
            Status::Pending,
        ))
    }

    fn stamp(
        sender: String,
        receiver: String,
        intent: Intent,
        content: Value,
        context: Context,
        status: Status,
    ) -> Self {
        Self {
            id: EnvelopeId::generate(),
            created_at: Utc::now(),
            sender,
            receiver,
            intent,
            content,
            context,
            status,
            retries: 0,
        }
    }

    /// Adds a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole context map.
    pub fn with_context_map(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Builds the success response to `inbound`.
    ///
    /// The response is sent by the capability that handled `inbound`, carries
    /// the retry count it took to succeed, and links back to `inbound` under
    /// `context.prev_message`.
    pub fn reply(inbound: &Envelope, content: Value, route: &Route) -> Self {
        let mut context = Context::new();
        context.insert(CONTEXT_PREVIOUS.to_string(), inbound.to_link());

        let mut response = Self::stamp(
            inbound.receiver.clone(),
            route.receiver().to_string(),
            Intent::processed_result(),
            content,
            context,
            Status::Success,
        );
        response.retries = inbound.retries;
        response
    }

    /// Builds a terminal escalation for `inbound`, addressed back to its
    /// sender.
    pub fn escalation(inbound: &Envelope, intent: Intent, error: &Error) -> Self {
        let mut context = Context::new();
        context.insert(CONTEXT_ORIGINAL.to_string(), inbound.to_link());
        context.insert(CONTEXT_FAILURE.to_string(), Value::from(error.kind()));

        Self::stamp(
            ROUTER.to_string(),
            inbound.sender.clone(),
            intent,
            Value::String(error.to_string()),
            context,
            Status::Failed,
        )
    }

    /// Counts one more retry attempt and returns the new total.
    pub fn record_retry(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the receiver as a routing outcome.
    pub fn route(&self) -> Route {
        Route::from_receiver(self.receiver.as_str())
    }

    /// Returns the envelope an escalation was raised for, if it is embedded.
    ///
    /// Embedded copies carry their own links as ids only, so calling this on
    /// a decoded ancestor yields `None`; use [`Envelope::original_id`].
    pub fn original(&self) -> Option<Envelope> {
        self.linked(CONTEXT_ORIGINAL)
    }

    /// Returns the envelope a response answers, if it is embedded.
    pub fn previous(&self) -> Option<Envelope> {
        self.linked(CONTEXT_PREVIOUS)
    }

    /// Returns the id of the envelope an escalation was raised for, if any.
    pub fn original_id(&self) -> Option<EnvelopeId> {
        self.context.get(CONTEXT_ORIGINAL).and_then(link_id)
    }

    /// Returns the id of the envelope a response answers, if any.
    pub fn previous_id(&self) -> Option<EnvelopeId> {
        self.context.get(CONTEXT_PREVIOUS).and_then(link_id)
    }

    /// Walks `original`/`prev_message` links back to the first envelope.
    ///
    /// The immediate ancestor is decoded from this envelope's context; older
    /// ancestors are looked up by id in `history`. The returned chain starts
    /// with the immediate ancestor and stops at the first link that cannot
    /// be resolved.
    pub fn causal_chain(&self, history: &[Envelope]) -> Vec<Envelope> {
        let mut chain: Vec<Envelope> = Vec::new();
        let Some(first) = self.original().or_else(|| self.previous()) else {
            return chain;
        };
        let mut next_id = first.original_id().or_else(|| first.previous_id());
        chain.push(first);

        // Ancestors always precede their descendants in `history`
        let mut end = history.len();
        while let Some(id) = next_id {
            let Some(pos) = history[..end].iter().rposition(|e| e.id == id) else {
                break;
            };
            end = pos;
            let ancestor = &history[pos];
            next_id = ancestor.original_id().or_else(|| ancestor.previous_id());
            chain.push(ancestor.clone());
        }
        chain
    }

    fn linked(&self, key: &str) -> Option<Envelope> {
        match self.context.get(key) {
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    /// Serializes this envelope for embedding in another envelope's context,
    /// with its own provenance links reduced to ids.
    fn to_link(&self) -> Value {
        let mut shallow = self.clone();
        for key in [CONTEXT_ORIGINAL, CONTEXT_PREVIOUS] {
            if let Some(id) = self.context.get(key).and_then(link_id) {
                shallow.context.insert(key.to_string(), Value::String(id.to_string()));
            }
        }
        serde_json::to_value(shallow).unwrap_or(Value::Null)
    }
}

/// Reads an envelope id from either an embedded envelope or an id reference.
fn link_id(value: &Value) -> Option<EnvelopeId> {
    match value {
        Value::String(id) => Uuid::parse_str(id).ok().map(EnvelopeId),
        Value::Object(fields) => fields
            .get("id")
            .and_then(|id| serde_json::from_value(id.clone()).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn user_envelope() -> Envelope {
        Envelope::new("User", "Intake", "parse_customer_intent", "x").unwrap()
    }

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = user_envelope()
            .with_context("ticket", "OPS-12");

        assert_eq!(envelope.sender(), "User");
        assert_eq!(envelope.receiver(), "Intake");
        assert_eq!(envelope.intent().as_str(), "parse_customer_intent");
        assert_eq!(envelope.content(), &json!("x"));
        assert_eq!(envelope.context()["ticket"], json!("OPS-12"));
        assert_eq!(envelope.status(), Status::Pending);
        assert_eq!(envelope.retries(), 0);
    }

    #[test]
    fn test_empty_names_rejected() {
        let err = Envelope::new("", "Intake", "go", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope(_)));

        let err = Envelope::new("User", "", "go", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope(_)));
    }

    #[test]
    fn test_whitespace_names_kept_as_supplied() {
        let envelope = Envelope::new(" User ", "  ", "go", "x").unwrap();
        assert_eq!(envelope.sender(), " User ");
        assert_eq!(envelope.receiver(), "  ");
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<EnvelopeId> = (0..1000).map(|_| user_envelope().id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_reply_links_previous() {
        let mut inbound = user_envelope();
        inbound.record_retry();

        let response = Envelope::reply(&inbound, json!({"parsed": true}), &Route::to("Transform"));

        assert_ne!(response.id(), inbound.id());
        assert_eq!(response.sender(), "Intake");
        assert_eq!(response.receiver(), "Transform");
        assert_eq!(response.intent().as_str(), Intent::PROCESSED_RESULT);
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.retries(), 1);
        assert_eq!(response.previous().unwrap(), inbound);
        assert!(response.original().is_none());
    }

    #[test]
    fn test_escalation_carries_original() {
        let inbound = user_envelope();
        let err = Error::UnknownReceiver("Intake".into());

        let escalation = Envelope::escalation(&inbound, Intent::error(), &err);

        assert_eq!(escalation.sender(), ROUTER);
        assert_eq!(escalation.receiver(), "User");
        assert_eq!(escalation.status(), Status::Failed);
        assert_eq!(escalation.retries(), 0);
        assert_eq!(escalation.content(), &json!("Unknown receiver: Intake"));
        assert_eq!(escalation.context()[CONTEXT_FAILURE], json!("unknown_receiver"));
        assert_eq!(escalation.original().unwrap(), inbound);
    }

    #[test]
    fn test_causal_chain_walks_to_start() {
        let start = user_envelope();
        let first = Envelope::reply(&start, json!("a"), &Route::to("Transform"));
        let err = Error::CapabilityFailure {
            capability: "Transform".into(),
            reason: "bad input".into(),
        };
        let escalation = Envelope::escalation(&first, Intent::failure_notification(), &err);

        let history = vec![start.clone(), first.clone()];
        let chain = escalation.causal_chain(&history);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id(), first.id());
        assert_eq!(chain[1].id(), start.id());

        // Without history only the embedded ancestor is known
        assert_eq!(escalation.causal_chain(&[]).len(), 1);
    }

    #[test]
    fn test_provenance_stays_one_level_deep() {
        let start = user_envelope();
        let first = Envelope::reply(&start, json!("a"), &Route::to("B"));
        let second = Envelope::reply(&first, json!("b"), &Route::to("A"));

        let previous = second.previous().unwrap();
        assert_eq!(previous.id(), first.id());
        assert_eq!(previous.content(), &json!("a"));
        assert!(previous.previous().is_none());
        assert_eq!(previous.previous_id(), Some(start.id()));
        assert_eq!(
            previous.context()[CONTEXT_PREVIOUS],
            json!(start.id().to_string())
        );
    }

    #[test]
    fn test_long_reply_chain_has_constant_depth() {
        let mut current = user_envelope();
        for hop in 0..10_000 {
            let next = if hop % 2 == 0 { "B" } else { "A" };
            current = Envelope::reply(&current, json!(hop), &Route::to(next));
        }

        let encoded = serde_json::to_string(&current).unwrap();
        assert!(encoded.len() < 2048);
        assert_eq!(current.previous().unwrap().content(), &json!(9_998));
    }

    #[test]
    fn test_final_receiver_is_terminal_route() {
        let envelope = Envelope::reply(&user_envelope(), json!(null), &Route::Terminate);
        assert_eq!(envelope.receiver(), "Final");
        assert!(envelope.route().is_terminal());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&Status::Failed).unwrap(), "\"FAILED\"");
        assert!(Status::Success.is_terminal());
        assert!(!Status::Pending.is_terminal());
    }
}
