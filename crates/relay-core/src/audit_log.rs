//! Append-only audit log of every envelope that entered or left the
//! dispatcher.
//!
//! A log may be private to one run or shared by several concurrent runs.
//! Appends take a single lock, so a record is never observed half-written
//! and the order of records equals the order of appends.

use chrono::{DateTime, Utc};
use relay_proto::{Envelope, EnvelopeId, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Type alias for the observer callback function.
type Observer = Box<dyn Fn(&AuditRecord) + Send + Sync + 'static>;

/// Identifies one pipeline run within a (possibly shared) audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a record was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// The envelope entered the dispatcher (once per attempt).
    Dispatched,
    /// A success response left the dispatcher.
    Emitted,
    /// A terminal failure envelope left the dispatcher or driver.
    Escalated,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Dispatched => "dispatched",
            AuditKind::Emitted => "emitted",
            AuditKind::Escalated => "escalated",
        }
    }
}

/// One audit entry, exported to reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: RunId,
    pub kind: AuditKind,
    pub envelope_id: EnvelopeId,
    pub sender: String,
    pub receiver: String,
    pub intent: String,
    pub status: Status,
    pub retries: u32,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Snapshots the routing metadata of an envelope.
    pub fn from_envelope(run_id: RunId, kind: AuditKind, envelope: &Envelope) -> Self {
        Self {
            run_id,
            kind,
            envelope_id: envelope.id(),
            sender: envelope.sender().to_string(),
            receiver: envelope.receiver().to_string(),
            intent: envelope.intent().to_string(),
            status: envelope.status(),
            retries: envelope.retries(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered, append-only record store.
#[derive(Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
    observers: Mutex<Vec<Observer>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer that receives every appended record.
    ///
    /// Observers run while the append lock is held so they see records in
    /// log order. An observer must not append to the same log.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&AuditRecord) + Send + Sync + 'static,
    {
        lock(&self.observers).push(Box::new(observer));
    }

    /// Appends a record and returns its position.
    pub fn append(&self, record: AuditRecord) -> usize {
        let mut records = lock(&self.records);
        for observer in lock(&self.observers).iter() {
            observer(&record);
        }
        records.push(record);
        records.len() - 1
    }

    /// Returns a snapshot of all records in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }

    /// Returns the records appended by one run.
    pub fn records_for(&self, run_id: RunId) -> Vec<AuditRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Returns only the records of envelopes entering the dispatcher.
    pub fn dispatches(&self) -> Vec<AuditRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.kind == AuditKind::Dispatched)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.len())
            .field("observers", &lock(&self.observers).len())
            .finish()
    }
}

// A panicking observer must not cost us the records already written.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The audit sink handed to the dispatcher for one run.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    log: Arc<AuditLog>,
    run_id: RunId,
}

impl AuditTrail {
    /// Creates a trail writing to a fresh private log.
    pub fn new() -> Self {
        Self::shared(Arc::new(AuditLog::new()))
    }

    /// Creates a trail for a new run writing to an existing log.
    pub fn shared(log: Arc<AuditLog>) -> Self {
        Self {
            log,
            run_id: RunId::generate(),
        }
    }

    /// Appends a snapshot of `envelope` tagged with this run.
    pub fn record(&self, kind: AuditKind, envelope: &Envelope) {
        self.log
            .append(AuditRecord::from_envelope(self.run_id, kind, envelope));
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn log(&self) -> &Arc<AuditLog> {
        &self.log
    }

    /// Returns the records this run appended so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.log.records_for(self.run_id)
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}
