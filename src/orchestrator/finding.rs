//! Plan state and the finding a diagnostic run produces.

use std::fmt;

use serde::{Serialize, Serializer};

use super::insight::{self, Insight, Recommendation};
use super::OrchestrationError;
use crate::analysis::{self, ContributionShare, DimensionBreakdown, Row, TrendSummary};
use crate::patterns::{ContributionPair, StepRole};

/// Where a diagnostic run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlanState {
    Planned,
    Executing { step: usize },
    Concluded,
    Aborted { step: usize },
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanState::Planned => f.write_str("planned"),
            PlanState::Executing { step } => write!(f, "executing({})", step),
            PlanState::Concluded => f.write_str("concluded"),
            PlanState::Aborted { step } => write!(f, "aborted({})", step),
        }
    }
}

/// SQL compiled for one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSql {
    pub step: usize,
    pub role: StepRole,
    pub sql: String,
    pub fingerprint: String,
}

/// A step that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: usize,
    pub role: StepRole,
    /// Canonical metric alias the rows are keyed by.
    pub metric: String,
    /// Canonical group-by aliases, as run.
    pub group_by: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticFinding {
    pub state: PlanState,
    pub metric: String,
    /// The candidate whose top value best accounts for the total change.
    pub explaining_dimension: Option<String>,
    /// Ranked contributors within the explaining dimension.
    pub root_cause_candidates: Vec<ContributionShare>,
    /// Every candidate measured, in plan order.
    pub breakdowns: Vec<DimensionBreakdown>,
    pub total_delta: f64,
    pub trend: TrendSummary,
    pub trend_confirmed: bool,
    pub confidence: f64,
    pub insights: Vec<Insight>,
    pub recommendations: Vec<Recommendation>,
    pub per_step_sql: Vec<StepSql>,
    /// Results of every completed step, kept when the run aborts.
    pub completed_steps: Vec<StepResult>,
    #[serde(serialize_with = "display_error")]
    pub error: Option<OrchestrationError>,
}

impl DiagnosticFinding {
    /// Fold completed step results into the finding. Whatever completed is
    /// analyzed, even on an aborted run.
    pub(super) fn assemble(
        state: PlanState,
        metric: String,
        contributions: &[ContributionPair],
        per_step_sql: Vec<StepSql>,
        completed_steps: Vec<StepResult>,
        error: Option<OrchestrationError>,
    ) -> Self {
        let trend = completed_steps
            .iter()
            .find(|s| s.role == StepRole::Trend)
            .map_or_else(TrendSummary::empty, |s| {
                let period = s.group_by.first().map_or("", String::as_str);
                analysis::summarize_trend(&s.rows, period, &s.metric)
            });

        let breakdowns = super::breakdowns(contributions, &completed_steps);
        let explaining = analysis::most_explaining(&breakdowns);
        let (explaining_dimension, root_cause_candidates, total_delta) = match explaining {
            Some(i) => (
                Some(breakdowns[i].dimension.clone()),
                breakdowns[i].shares.clone(),
                breakdowns[i].total_delta,
            ),
            None => (None, Vec::new(), 0.0),
        };
        let trend_confirmed = analysis::trend_confirmed(trend.direction, total_delta);
        let confidence = analysis::confidence(&root_cause_candidates, trend_confirmed);

        let insights = insight::insights(&metric, &trend, &breakdowns, explaining);
        let recommendations = insight::recommendations(&trend, explaining_dimension.as_deref());

        Self {
            state,
            metric,
            explaining_dimension,
            root_cause_candidates,
            breakdowns,
            total_delta,
            trend,
            trend_confirmed,
            confidence,
            insights,
            recommendations,
            per_step_sql,
            completed_steps,
            error,
        }
    }

    pub fn top_contributor(&self) -> Option<&ContributionShare> {
        self.root_cause_candidates.first()
    }

    pub fn step_result(&self, step: usize) -> Option<&StepResult> {
        self.completed_steps.iter().find(|s| s.step == step)
    }
}

fn display_error<S: Serializer>(
    error: &Option<OrchestrationError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}
