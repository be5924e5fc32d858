//! Diagnostic orchestration.
//!
//! Runs a [`DiagnosticPlan`] one step at a time:
//!
//! ```text
//! Planned → Executing(1) → … → Executing(n) → Concluded
//!                  └──────────┴──→ Aborted(i)
//! ```
//!
//! Each step is compiled through a [`StepCompiler`] (validation, row-level
//! security, compilation) exactly like a standalone query, then handed to
//! the [`QueryExecutor`]. Step `i + 1` starts only after step `i` returned.
//! A failure or cancellation aborts the run but keeps every completed
//! step's rows in the finding.

mod executor;
mod finding;
mod insight;

pub use executor::{CancelHandle, CancelSignal, ExecutionError, ExecutionOutput, QueryExecutor};
pub use finding::{DiagnosticFinding, PlanState, StepResult, StepSql};
pub use insight::{Insight, Recommendation};

use serde_json::Value;
use uuid::Uuid;

use crate::analysis::{self, DimensionBreakdown, Row};
use crate::audit::{AuditRecord, AuditSink};
use crate::compiler::CompiledStatement;
use crate::error::{ErrorKind, SemqlError, SemqlResult};
use crate::patterns::{ContributionPair, DiagnosticPlan, DiagnosticStep, StepDependency};
use crate::query::{Filter, FilterOp, FilterValue, StructuredQuery};

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("diagnostic step {step} failed: {source}")]
    StepFailed {
        step: usize,
        #[source]
        source: Box<SemqlError>,
    },

    #[error("diagnostic plan cancelled at step {step}")]
    Cancelled { step: usize },

    #[error("step {step} needs a '{dimension}' value from earlier steps, and none was usable")]
    MissingDependencyValue { step: usize, dimension: String },
}

impl OrchestrationError {
    /// The step the run stopped at.
    pub fn step(&self) -> usize {
        match self {
            OrchestrationError::StepFailed { step, .. }
            | OrchestrationError::Cancelled { step }
            | OrchestrationError::MissingDependencyValue { step, .. } => *step,
        }
    }
}

/// A step query after validation, security and compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    /// The secured query, names canonicalized.
    pub query: StructuredQuery,
    pub statement: CompiledStatement,
}

/// Turns a structured query into an executable statement, applying every
/// check a standalone query gets.
pub trait StepCompiler: Send + Sync {
    fn compile_step(&self, query: &StructuredQuery) -> SemqlResult<CompiledStep>;
}

pub struct DiagnosticOrchestrator<'a> {
    compiler: &'a dyn StepCompiler,
    executor: &'a dyn QueryExecutor,
    audit: &'a dyn AuditSink,
    query_id: Uuid,
    user_id: Option<String>,
}

impl<'a> DiagnosticOrchestrator<'a> {
    pub fn new(
        compiler: &'a dyn StepCompiler,
        executor: &'a dyn QueryExecutor,
        audit: &'a dyn AuditSink,
    ) -> Self {
        Self {
            compiler,
            executor,
            audit,
            query_id: Uuid::new_v4(),
            user_id: None,
        }
    }

    /// Tie step audit records to an existing request.
    #[must_use]
    pub fn for_request(mut self, query_id: Uuid, user_id: Option<&str>) -> Self {
        self.query_id = query_id;
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub async fn run(&self, plan: &DiagnosticPlan, cancel: &CancelSignal) -> DiagnosticFinding {
        let mut state = PlanState::Planned;
        let mut per_step_sql = Vec::new();
        let mut completed: Vec<StepResult> = Vec::new();
        let mut metric = plan.metric().to_string();

        tracing::info!(
            query_id = %self.query_id,
            steps = plan.steps().len(),
            candidates = ?plan.candidate_dimensions(),
            "diagnostic plan started"
        );

        for step in plan.steps() {
            self.transition(&mut state, PlanState::Executing { step: step.index });
            match self
                .run_step(step, &completed, cancel, &mut per_step_sql)
                .await
            {
                Ok(result) => {
                    metric.clone_from(&result.metric);
                    completed.push(result);
                }
                Err(error) => {
                    self.transition(&mut state, PlanState::Aborted { step: step.index });
                    tracing::warn!(
                        query_id = %self.query_id,
                        step = step.index,
                        completed = completed.len(),
                        error = %error,
                        "diagnostic plan aborted"
                    );
                    return DiagnosticFinding::assemble(
                        state,
                        metric,
                        plan.contributions(),
                        per_step_sql,
                        completed,
                        Some(error),
                    );
                }
            }
        }

        self.transition(&mut state, PlanState::Concluded);
        let finding = DiagnosticFinding::assemble(
            state,
            metric,
            plan.contributions(),
            per_step_sql,
            completed,
            None,
        );
        tracing::info!(
            query_id = %self.query_id,
            explaining = ?finding.explaining_dimension,
            candidates = finding.root_cause_candidates.len(),
            confidence = finding.confidence,
            trend_confirmed = finding.trend_confirmed,
            "diagnostic plan concluded"
        );
        finding
    }

    async fn run_step(
        &self,
        step: &DiagnosticStep,
        completed: &[StepResult],
        cancel: &CancelSignal,
        per_step_sql: &mut Vec<StepSql>,
    ) -> Result<StepResult, OrchestrationError> {
        let index = step.index;
        if cancel.is_cancelled() {
            return Err(self.cancelled(index, &step.query, None));
        }

        let query = match resolve_dependency(step, completed) {
            Ok(query) => query,
            Err(error) => return Err(self.audit_failure(index, &step.query, None, error)),
        };

        let compiled = self.compiler.compile_step(&query).map_err(|e| {
            let error = OrchestrationError::StepFailed {
                step: index,
                source: Box::new(e),
            };
            self.audit_failure(index, &query, None, error)
        })?;
        per_step_sql.push(StepSql {
            step: index,
            role: step.role,
            sql: compiled.statement.sql.clone(),
            fingerprint: compiled.statement.fingerprint.clone(),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.cancelled(index, &compiled.query, Some(&compiled.statement)));
            }
            outcome = self.executor.execute(&compiled.statement) => outcome,
        };

        match outcome {
            Ok(output) => {
                self.audit.record(
                    &AuditRecord::for_query(self.query_id, self.user_id.as_deref(), &compiled.query)
                        .at_step(index)
                        .with_statement(&compiled.statement)
                        .with_output(&output),
                );
                Ok(StepResult {
                    step: index,
                    role: step.role,
                    metric: compiled.query.primary_metric().to_string(),
                    group_by: compiled.query.group_by_dimensions().to_vec(),
                    row_count: output.row_count,
                    execution_time_ms: output.execution_time_ms(),
                    rows: output.rows,
                })
            }
            Err(e) => {
                let error = OrchestrationError::StepFailed {
                    step: index,
                    source: Box::new(SemqlError::Execution(e)),
                };
                Err(self.audit_failure(index, &compiled.query, Some(&compiled.statement), error))
            }
        }
    }

    fn cancelled(
        &self,
        step: usize,
        query: &StructuredQuery,
        statement: Option<&CompiledStatement>,
    ) -> OrchestrationError {
        self.audit_failure(step, query, statement, OrchestrationError::Cancelled { step })
    }

    /// Record a failed step and hand the error back.
    fn audit_failure(
        &self,
        step: usize,
        query: &StructuredQuery,
        statement: Option<&CompiledStatement>,
        error: OrchestrationError,
    ) -> OrchestrationError {
        let mut record =
            AuditRecord::for_query(self.query_id, self.user_id.as_deref(), query).at_step(step);
        if let Some(statement) = statement {
            record = record.with_statement(statement);
        }
        let record = match &error {
            OrchestrationError::StepFailed { source, .. } => record.with_error(source),
            other => record.with_failure(ErrorKind::Orchestration, other),
        };
        self.audit.record(&record);
        error
    }

    fn transition(&self, state: &mut PlanState, next: PlanState) {
        tracing::debug!(
            query_id = %self.query_id,
            from = %state,
            to = %next,
            "diagnostic state transition"
        );
        *state = next;
    }
}

/// Breakdowns for every pair whose two steps both completed, in pair order.
fn breakdowns(
    pairs: &[ContributionPair],
    completed: &[StepResult],
) -> Vec<DimensionBreakdown> {
    let result = |i: usize| completed.iter().find(|r| r.step == i);
    pairs
        .iter()
        .filter_map(|pair| {
            let current = result(pair.current_step)?;
            let prior = result(pair.prior_step)?;
            Some(DimensionBreakdown::new(
                &pair.dimension,
                &current.rows,
                &prior.rows,
                &current.metric,
            ))
        })
        .collect()
}

/// Fill in the step's runtime filter and grouping from earlier results.
fn resolve_dependency(
    step: &DiagnosticStep,
    completed: &[StepResult],
) -> Result<StructuredQuery, OrchestrationError> {
    let Some(StepDependency::TopContributor { candidates }) = &step.depends_on else {
        return Ok(step.query.clone());
    };

    let missing = |dimension: String| OrchestrationError::MissingDependencyValue {
        step: step.index,
        dimension,
    };
    let all_candidates = || {
        candidates
            .iter()
            .map(|p| p.dimension.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let breakdowns = breakdowns(candidates, completed);
    let chosen = analysis::most_explaining(&breakdowns)
        .map(|i| &breakdowns[i])
        .ok_or_else(|| missing(all_candidates()))?;
    let dimension = chosen.dimension.as_str();
    let top = chosen.top().ok_or_else(|| missing(dimension.to_string()))?;

    let pair = candidates
        .iter()
        .find(|p| p.dimension == dimension)
        .ok_or_else(|| missing(dimension.to_string()))?;
    let rows_of = |i: usize| {
        completed
            .iter()
            .find(|r| r.step == i)
            .map_or(&[][..], |r| r.rows.as_slice())
    };
    // A null group cannot be filtered back to with `=`.
    let value = original_value(dimension, &top.value, rows_of(pair.current_step))
        .or_else(|| original_value(dimension, &top.value, rows_of(pair.prior_step)))
        .ok_or_else(|| missing(dimension.to_string()))?;

    let split_by = candidates
        .iter()
        .find(|p| p.dimension != dimension)
        .ok_or_else(|| missing(all_candidates()))?;

    tracing::debug!(
        step = step.index,
        dimension = %dimension,
        split_by = %split_by.dimension,
        share = top.share,
        "drilling into top contributor"
    );
    let mut query = step.query.clone();
    query.dimensionality.group_by = vec![split_by.dimension.clone()];
    query
        .filters
        .push(Filter::new(dimension.to_string(), FilterOp::Eq, [value]));
    Ok(query)
}

/// The cell behind a contributor's text key, typed as a filter value.
fn original_value(dimension: &str, text: &str, rows: &[Row]) -> Option<FilterValue> {
    let row = rows
        .iter()
        .find(|row| analysis::cell_text(row, dimension) == text)?;
    match row.get(dimension)? {
        Value::String(s) => Some(FilterValue::Text(s.clone())),
        Value::Bool(b) => Some(FilterValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(FilterValue::Int)
            .or_else(|| n.as_f64().map(FilterValue::Float)),
        _ => None,
    }
}
