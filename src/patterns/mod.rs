//! Query pattern grammar.
//!
//! Expands an analytic intent into the structured queries that answer it.
//! Expansion never validates; every query it produces goes through the
//! validator and row-level security like any other.

mod diagnostic;

pub use diagnostic::{
    ContributionPair, DiagnosticPlan, DiagnosticStep, StepDependency, StepRole,
};

use serde::Serialize;

use crate::config::DiagnosticSettings;
use crate::query::time::PRECEDING_PREFIX;
use crate::query::{Grain, Intent, SortDirection, StructuredQuery, TimeWindow};
use crate::registry::{DimensionDef, Registry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("no time dimension is registered at {0} grain")]
    NoTimeDimension(Grain),

    #[error("no dimension can explain changes in '{metric}'")]
    NoCandidateDimension { metric: String },

    #[error("step {step} depends on step {depends_on}, which does not run before it")]
    ForwardDependency { step: usize, depends_on: usize },

    #[error("step at position {position} is numbered {index}")]
    StepOutOfOrder { position: usize, index: usize },

    #[error("contribution refers to step {0}, which is not in the plan")]
    UnknownStep(usize),

    #[error("window '{0}' is already a preceding period")]
    NestedComparison(String),
}

/// Current and prior period queries, identical except for the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonPair {
    pub current: StructuredQuery,
    pub prior: StructuredQuery,
}

/// The result of expanding one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expansion {
    Single { query: StructuredQuery },
    Comparison(ComparisonPair),
    Diagnostic(DiagnosticPlan),
}

impl Expansion {
    /// Every query in the expansion, in execution order.
    pub fn queries(&self) -> Vec<&StructuredQuery> {
        match self {
            Expansion::Single { query } => vec![query],
            Expansion::Comparison(pair) => vec![&pair.current, &pair.prior],
            Expansion::Diagnostic(plan) => plan.steps().iter().map(|s| &s.query).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternGrammar<'r> {
    registry: &'r Registry,
    settings: DiagnosticSettings,
}

impl<'r> PatternGrammar<'r> {
    pub fn new(registry: &'r Registry, settings: DiagnosticSettings) -> Self {
        Self { registry, settings }
    }

    pub fn expand(&self, query: &StructuredQuery) -> Result<Expansion, PatternError> {
        let expansion = match query.intent {
            Intent::Trend => Expansion::Single {
                query: self.trend(query)?,
            },
            Intent::Comparison => Expansion::Comparison(self.comparison(query)?),
            Intent::Ranking => Expansion::Single {
                query: self.ranking(query),
            },
            Intent::Snapshot => Expansion::Single {
                query: self.snapshot(query),
            },
            Intent::Diagnostic => Expansion::Diagnostic(self.diagnostic(query)?),
        };
        tracing::debug!(
            intent = %query.intent,
            queries = expansion.queries().len(),
            "expanded query pattern"
        );
        Ok(expansion)
    }

    /// Force the time dimension for the requested grain to the front of
    /// group-by. Without an explicit sort the result is ordered by it.
    pub fn trend(&self, query: &StructuredQuery) -> Result<StructuredQuery, PatternError> {
        let grain = query.time_context.grain;
        let time = self
            .registry
            .time_dimension_for(grain)
            .ok_or(PatternError::NoTimeDimension(grain))?;

        let mut out = query.clone();
        out.intent = Intent::Trend;
        out.dimensionality
            .group_by
            .retain(|name| self.time_dimension(name).is_none());
        out.dimensionality.group_by.insert(0, time.name.clone());
        if out.sorting.is_none() {
            out = out.sort(time.name.clone(), SortDirection::Asc, None);
        }
        Ok(out)
    }

    /// The same query over the current window and over the period right
    /// before it.
    pub fn comparison(&self, query: &StructuredQuery) -> Result<ComparisonPair, PatternError> {
        let prior_window = preceding_window(&query.time_context.window)?;
        let mut current = query.clone();
        current.intent = Intent::Comparison;
        let prior = current.clone().window(prior_window);
        Ok(ComparisonPair { current, prior })
    }

    /// Rankings pass through; the validator enforces sort and limit.
    pub fn ranking(&self, query: &StructuredQuery) -> StructuredQuery {
        query.clone()
    }

    /// Drop time grouping, and any sort on a time dimension.
    pub fn snapshot(&self, query: &StructuredQuery) -> StructuredQuery {
        let mut out = query.clone();
        out.intent = Intent::Snapshot;
        out.dimensionality
            .group_by
            .retain(|name| self.time_dimension(name).is_none());
        if out
            .sorting
            .as_ref()
            .is_some_and(|s| self.time_dimension(&s.order_by).is_some())
        {
            out.sorting = None;
        }
        out
    }

    pub fn diagnostic(&self, query: &StructuredQuery) -> Result<DiagnosticPlan, PatternError> {
        let mut candidates = self.explaining_dimensions(query);
        if candidates.is_empty() {
            return Err(PatternError::NoCandidateDimension {
                metric: query.primary_metric().to_string(),
            });
        }
        candidates.truncate(self.settings.max_candidates);
        diagnostic::plan(self, query, &candidates, self.settings.drill_down)
    }

    /// Dimensions that may explain a change in the query's metric, best
    /// first: the caller's own non-time group-by, then the configured
    /// candidates that fit the metric.
    fn explaining_dimensions(&self, query: &StructuredQuery) -> Vec<String> {
        let metric = self.registry.resolve_metric(query.primary_metric()).ok();
        let fits = |dimension: &DimensionDef| {
            !dimension.is_time()
                && metric.map_or(true, |m| {
                    m.allows_group_by(&dimension.name) && dimension.is_joinable_to(&m.table)
                })
        };

        let mut out: Vec<String> = Vec::new();
        let named = query
            .group_by_dimensions()
            .iter()
            .chain(&self.settings.candidate_dimensions);
        for name in named {
            let Ok(dimension) = self.registry.resolve_dimension(name) else {
                continue;
            };
            if fits(dimension) && !out.contains(&dimension.name) {
                out.push(dimension.name.clone());
            }
        }
        out
    }

    fn time_dimension(&self, name: &str) -> Option<&'r DimensionDef> {
        self.registry
            .resolve_dimension(name)
            .ok()
            .filter(|d| d.is_time())
    }
}

/// Window string for the period right before `window`.
fn preceding_window(window: &str) -> Result<String, PatternError> {
    let window = window.trim();
    match window.parse::<TimeWindow>() {
        Ok(TimeWindow::Named(named)) => Ok(TimeWindow::Preceding(named).to_string()),
        Ok(TimeWindow::Preceding(_)) => Err(PatternError::NestedComparison(window.to_string())),
        // Left for the validator to report.
        Err(_) => Ok(format!("{}{}", PRECEDING_PREFIX, window)),
    }
}
