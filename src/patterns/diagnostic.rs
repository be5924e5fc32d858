//! Diagnostic plans: ordered steps with forward-only dependencies.

use std::fmt;

use serde::Serialize;

use super::{preceding_window, PatternError, PatternGrammar};
use crate::query::{Intent, StructuredQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    /// The metric over time for the current window.
    Trend,
    /// The metric by one candidate dimension, current window.
    ContributionCurrent,
    /// The metric by one candidate dimension, preceding window.
    ContributionPrior,
    /// The metric inside the contributor that best explains the change,
    /// split by the next candidate dimension.
    DrillDown,
}

impl fmt::Display for StepRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepRole::Trend => "trend",
            StepRole::ContributionCurrent => "contribution_current",
            StepRole::ContributionPrior => "contribution_prior",
            StepRole::DrillDown => "drill_down",
        };
        f.write_str(name)
    }
}

/// The two steps that measure one candidate dimension across both windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionPair {
    pub dimension: String,
    pub current_step: usize,
    pub prior_step: usize,
}

impl ContributionPair {
    pub fn steps(&self) -> [usize; 2] {
        [self.current_step, self.prior_step]
    }
}

/// Data a step needs from earlier steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDependency {
    /// Pick the candidate whose top value's delta comes closest to the
    /// total delta, filter to that value, and group by the first other
    /// candidate.
    TopContributor { candidates: Vec<ContributionPair> },
}

impl StepDependency {
    pub fn steps(&self) -> Vec<usize> {
        match self {
            StepDependency::TopContributor { candidates } => {
                candidates.iter().flat_map(ContributionPair::steps).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticStep {
    /// 1-based position in the plan.
    pub index: usize,
    pub role: StepRole,
    pub query: StructuredQuery,
    pub depends_on: Option<StepDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticPlan {
    metric: String,
    contributions: Vec<ContributionPair>,
    steps: Vec<DiagnosticStep>,
}

impl DiagnosticPlan {
    /// Assemble a plan. Steps must be numbered 1..=n in order, every
    /// dependency must point strictly backwards, and every contribution
    /// pair must name steps in the plan.
    pub fn new(
        metric: impl Into<String>,
        contributions: Vec<ContributionPair>,
        steps: Vec<DiagnosticStep>,
    ) -> Result<Self, PatternError> {
        if let Some((position, step)) = steps
            .iter()
            .enumerate()
            .find(|(i, s)| s.index != i + 1)
        {
            return Err(PatternError::StepOutOfOrder {
                position: position + 1,
                index: step.index,
            });
        }
        for step in &steps {
            let Some(dependency) = &step.depends_on else {
                continue;
            };
            if let Some(bad) = dependency
                .steps()
                .into_iter()
                .find(|&d| d == 0 || d >= step.index)
            {
                return Err(PatternError::ForwardDependency {
                    step: step.index,
                    depends_on: bad,
                });
            }
        }
        if let Some(bad) = contributions
            .iter()
            .flat_map(ContributionPair::steps)
            .find(|&i| i == 0 || i > steps.len())
        {
            return Err(PatternError::UnknownStep(bad));
        }
        Ok(Self {
            metric: metric.into(),
            contributions,
            steps,
        })
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Candidate dimensions with their steps, in preference order.
    pub fn contributions(&self) -> &[ContributionPair] {
        &self.contributions
    }

    pub fn candidate_dimensions(&self) -> Vec<&str> {
        self.contributions
            .iter()
            .map(|p| p.dimension.as_str())
            .collect()
    }

    pub fn steps(&self) -> &[DiagnosticStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&DiagnosticStep> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }
}

/// Trend first, then a current/prior pair per candidate, then the
/// optional drill-down. Only the drill-down depends on earlier rows.
pub(super) fn plan(
    grammar: &PatternGrammar<'_>,
    query: &StructuredQuery,
    candidates: &[String],
    drill_down: bool,
) -> Result<DiagnosticPlan, PatternError> {
    let prior_window = preceding_window(&query.time_context.window)?;

    // Every step keeps the caller's filters, question and confidence, but
    // none of its grouping or sorting.
    let mut base = query.clone();
    base.intent = Intent::Snapshot;
    base.dimensionality.group_by.clear();
    base.sorting = None;
    base.metric_request.secondary_metrics.clear();

    let mut trend = base.clone();
    trend.intent = Intent::Trend;
    let mut steps = vec![DiagnosticStep {
        index: 1,
        role: StepRole::Trend,
        query: grammar.trend(&trend)?,
        depends_on: None,
    }];

    let mut contributions = Vec::with_capacity(candidates.len());
    for dimension in candidates {
        let current = base.clone().group_by(dimension.clone());
        let prior = current.clone().window(prior_window.clone());
        let pair = ContributionPair {
            dimension: dimension.clone(),
            current_step: steps.len() + 1,
            prior_step: steps.len() + 2,
        };
        steps.push(DiagnosticStep {
            index: pair.current_step,
            role: StepRole::ContributionCurrent,
            query: current,
            depends_on: None,
        });
        steps.push(DiagnosticStep {
            index: pair.prior_step,
            role: StepRole::ContributionPrior,
            query: prior,
            depends_on: None,
        });
        contributions.push(pair);
    }

    // The grouping is filled in at run time, once the explaining
    // dimension is known.
    if drill_down && contributions.len() >= 2 {
        steps.push(DiagnosticStep {
            index: steps.len() + 1,
            role: StepRole::DrillDown,
            query: base,
            depends_on: Some(StepDependency::TopContributor {
                candidates: contributions.clone(),
            }),
        });
    }

    DiagnosticPlan::new(query.primary_metric(), contributions, steps)
}
