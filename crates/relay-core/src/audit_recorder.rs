//! JSONL export of audit records.
//!
//! `AuditRecorder` writes one JSON object per line so a crashed run still
//! leaves a readable prefix. Records from the audit log use the event
//! names `audit.dispatched`, `audit.emitted` and `audit.escalated`; run
//! boundaries use `_meta.run_start` and `_meta.run_end`.

use crate::audit_log::{AuditLog, AuditRecord, RunId};
use crate::pipeline::{PipelineRun, RunMode};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// One line of the JSONL export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    /// Unix timestamp in milliseconds when the line was written.
    pub ts: i64,

    /// Discriminator such as `audit.dispatched` or `_meta.run_end`.
    pub event: String,

    pub data: serde_json::Value,
}

impl Line {
    pub fn new(event: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn from_audit_record(record: &AuditRecord) -> Self {
        Self::new(format!("audit.{}", record.kind.as_str()), record)
    }

    pub fn meta_run_start(run_id: RunId, receiver: &str, mode: &RunMode) -> Self {
        Self::new(
            "_meta.run_start",
            serde_json::json!({
                "run_id": run_id,
                "receiver": receiver,
                "mode": mode.to_string(),
            }),
        )
    }

    pub fn meta_run_end(run: &PipelineRun) -> Self {
        Self::new(
            "_meta.run_end",
            serde_json::json!({
                "run_id": run.run_id,
                "outcome": run.outcome.as_str(),
                "exit_code": run.outcome.exit_code(),
                "dispatches": run.dispatches,
                "final_receiver": run.final_envelope.receiver(),
            }),
        )
    }
}

/// Writes audit records to a JSONL sink.
///
/// Thread-safe; one recorder may observe a log shared by concurrent runs.
pub struct AuditRecorder<W> {
    writer: Mutex<W>,
}

impl<W: Write> AuditRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn record(&self, record: &AuditRecord) {
        self.write_line(&Line::from_audit_record(record));
    }

    pub fn record_meta(&self, line: Line) {
        self.write_line(&line);
    }

    /// Writes every record of a finished run followed by its end marker.
    pub fn record_run(&self, run: &PipelineRun) {
        for record in &run.audit {
            self.record(record);
        }
        self.write_line(&Line::meta_run_end(run));
    }

    fn write_line(&self, line: &Line) {
        if let Ok(mut writer) = self.writer.lock() {
            // Export failures must not abort a run
            if let Ok(json) = serde_json::to_string(line) {
                let _ = writeln!(writer, "{json}");
            }
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .map_err(|_| io::Error::other("audit writer lock poisoned"))?
            .flush()
    }

    /// Consumes the recorder and returns the sink.
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send + 'static> AuditRecorder<W> {
    /// Streams every record appended to `log` from now on.
    pub fn attach(recorder: Arc<Self>, log: &AuditLog) {
        log.add_observer(move |record| recorder.record(record));
    }
}

/// Parses a JSONL export back into lines, skipping blank lines.
pub fn read_lines(input: &str) -> Result<Vec<Line>, serde_json::Error> {
    input
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
