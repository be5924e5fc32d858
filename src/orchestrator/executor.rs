//! The boundary to the SQL execution engine.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::analysis::Row;
use crate::compiler::CompiledStatement;

/// Runs compiled statements against a backing store.
///
/// Timeouts and retries belong to the implementation; the core never
/// retries a failed call.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: &CompiledStatement)
        -> Result<ExecutionOutput, ExecutionError>;
}

/// Rows returned by an executor, in result order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutput {
    pub rows: Vec<Row>,
    pub row_count: usize,
    #[serde(rename = "execution_time_ms", serialize_with = "as_millis")]
    pub execution_time: Duration,
}

impl ExecutionOutput {
    pub fn new(rows: Vec<Row>, execution_time: Duration) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            execution_time,
        }
    }

    pub fn execution_time_ms(&self) -> u64 {
        u64::try_from(self.execution_time.as_millis()).unwrap_or(u64::MAX)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

/// An executor failure, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("execution failed: {message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Requests cancellation of a running plan.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a running plan.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}
