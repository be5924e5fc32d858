//! Audit trail.
//!
//! One [`AuditRecord`] per request, and one per diagnostic step, whether it
//! succeeded or not. Sinks are append-only; a sink that cannot write logs
//! the failure and carries on, since auditing never fails a request.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compiler::CompiledStatement;
use crate::error::{ErrorKind, SemqlError};
use crate::orchestrator::ExecutionOutput;
use crate::query::{Intent, StructuredQuery};
use crate::sql::Dialect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub query_id: Uuid,
    pub user_id: Option<String>,
    pub question: Option<String>,
    pub intent: Option<Intent>,
    pub metric: Option<String>,
    pub dimensions: Vec<String>,
    pub time_window: Option<String>,
    pub filter_count: usize,
    pub sql: Option<String>,
    pub dialect: Option<Dialect>,
    pub fingerprint: Option<String>,
    pub result_count: Option<usize>,
    pub execution_time_ms: Option<u64>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// Diagnostic step index, for step-level records.
    pub step: Option<usize>,
}

impl AuditRecord {
    pub fn new(query_id: Uuid, user_id: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            query_id,
            user_id: user_id.map(str::to_string),
            question: None,
            intent: None,
            metric: None,
            dimensions: Vec::new(),
            time_window: None,
            filter_count: 0,
            sql: None,
            dialect: None,
            fingerprint: None,
            result_count: None,
            execution_time_ms: None,
            success: false,
            error_kind: None,
            error: None,
            step: None,
        }
    }

    /// Record describing `query`. The filter count includes any row-level
    /// security filters already appended.
    pub fn for_query(query_id: Uuid, user_id: Option<&str>, query: &StructuredQuery) -> Self {
        let mut record = Self::new(query_id, user_id);
        record.question = query.original_question.clone();
        record.intent = Some(query.intent);
        record.metric = Some(query.primary_metric().to_string());
        record.dimensions = query.group_by_dimensions().to_vec();
        record.time_window = Some(query.time_context.window.clone());
        record.filter_count = query.filters.len();
        record
    }

    #[must_use]
    pub fn with_statement(mut self, statement: &CompiledStatement) -> Self {
        self.sql = Some(statement.sql.clone());
        self.dialect = Some(statement.dialect);
        self.fingerprint = Some(statement.fingerprint.clone());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: &ExecutionOutput) -> Self {
        self.result_count = Some(output.row_count);
        self.execution_time_ms = Some(output.execution_time_ms());
        self.success = true;
        self
    }

    #[must_use]
    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self
    }

    #[must_use]
    pub fn with_error(self, error: &SemqlError) -> Self {
        self.with_failure(error.kind(), error)
    }

    #[must_use]
    pub fn with_failure(mut self, kind: ErrorKind, error: &dyn std::fmt::Display) -> Self {
        self.success = false;
        self.error_kind = Some(kind);
        self.error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn at_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }
}

/// Append-only destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl AuditSink for JsonLinesSink {
    fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.append(record) {
            tracing::warn!(
                path = %self.path.display(),
                query_id = %record.query_id,
                error = %e,
                "failed to write audit record"
            );
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: &AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Emits records as `tracing` events on the `semql::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, record: &AuditRecord) {
        tracing::info!(
            target: "semql::audit",
            query_id = %record.query_id,
            user_id = record.user_id.as_deref().unwrap_or("-"),
            intent = ?record.intent,
            metric = record.metric.as_deref().unwrap_or("-"),
            step = ?record.step,
            fingerprint = record.fingerprint.as_deref().unwrap_or("-"),
            rows = ?record.result_count,
            success = record.success,
            error_kind = ?record.error_kind,
            "audit"
        );
    }
}
