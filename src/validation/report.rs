//! Validation outcomes: errors, warnings, and certified queries.

use serde::Serialize;

use crate::query::{Intent, MetricVariant, SortDirection, StructuredQuery, TimeWindow};

/// A rule violation. Every variant names the offending field as a path
/// into the query (`filters[1].values`, `sorting.limit`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("{field}: unknown metric '{name}'")]
    UnknownMetric { field: String, name: String },

    #[error("{field}: unknown dimension '{name}'")]
    UnknownDimension { field: String, name: String },

    #[error("{field}: dimension '{dimension}' cannot be used with metric '{metric}'")]
    IncompatibleDimension {
        field: String,
        dimension: String,
        metric: String,
    },

    #[error("{field}: metric '{metric}' is not on the same fact as '{primary}'")]
    IncompatibleMetric {
        field: String,
        metric: String,
        primary: String,
    },

    #[error("{field}: dimension '{dimension}' is grouped more than once")]
    DuplicateDimension { field: String, dimension: String },

    #[error("{field}: {count} group-by dimensions exceed the maximum of {max}")]
    CardinalityExceeded {
        field: String,
        count: usize,
        max: usize,
    },

    #[error("{field}: {reason}")]
    MissingSort { field: String, reason: String },

    #[error("{field}: a trend needs a time dimension in group-by")]
    MissingTimeDimension { field: String },

    #[error("{field}: invalid time window '{window}': {reason}")]
    InvalidTimeWindow {
        field: String,
        window: String,
        reason: String,
    },

    #[error("{field}: {reason}")]
    MalformedFilter { field: String, reason: String },

    #[error("{field}: '{order_by}' is neither a selected metric nor a group-by dimension")]
    SortNotSelected { field: String, order_by: String },

    #[error("{field}: limit {limit} is above the maximum of {max}")]
    LimitOutOfRange { field: String, limit: u64, max: u64 },

    #[error("{field}: malformed query: {message}")]
    MalformedInput { field: String, message: String },
}

impl ValidationError {
    pub fn field(&self) -> &str {
        match self {
            ValidationError::UnknownMetric { field, .. }
            | ValidationError::UnknownDimension { field, .. }
            | ValidationError::IncompatibleDimension { field, .. }
            | ValidationError::IncompatibleMetric { field, .. }
            | ValidationError::DuplicateDimension { field, .. }
            | ValidationError::CardinalityExceeded { field, .. }
            | ValidationError::MissingSort { field, .. }
            | ValidationError::MissingTimeDimension { field }
            | ValidationError::InvalidTimeWindow { field, .. }
            | ValidationError::MalformedFilter { field, .. }
            | ValidationError::SortNotSelected { field, .. }
            | ValidationError::LimitOutOfRange { field, .. }
            | ValidationError::MalformedInput { field, .. } => field,
        }
    }

    /// Rule name, stable for logs.
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationError::UnknownMetric { .. } => "unknown_metric",
            ValidationError::UnknownDimension { .. } => "unknown_dimension",
            ValidationError::IncompatibleDimension { .. } => "incompatible_dimension",
            ValidationError::IncompatibleMetric { .. } => "incompatible_metric",
            ValidationError::DuplicateDimension { .. } => "duplicate_dimension",
            ValidationError::CardinalityExceeded { .. } => "cardinality_exceeded",
            ValidationError::MissingSort { .. } => "missing_sort",
            ValidationError::MissingTimeDimension { .. } => "missing_time_dimension",
            ValidationError::InvalidTimeWindow { .. } => "invalid_time_window",
            ValidationError::MalformedFilter { .. } => "malformed_filter",
            ValidationError::SortNotSelected { .. } => "sort_not_selected",
            ValidationError::LimitOutOfRange { .. } => "limit_out_of_range",
            ValidationError::MalformedInput { .. } => "malformed_input",
        }
    }
}

/// A non-blocking observation about a valid query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ValidationWarning {
    LowConfidence { confidence: f64, threshold: f64 },
    ZeroLimit,
    ChartWithoutGroupBy,
    VariantWithoutComparison { variant: MetricVariant, intent: Intent },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::LowConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "upstream confidence {:.2} is below {:.2}; the question may have been misread",
                confidence, threshold
            ),
            ValidationWarning::ZeroLimit => f.write_str("limit 0 returns no rows"),
            ValidationWarning::ChartWithoutGroupBy => {
                f.write_str("chart requested for a query with no group-by dimension")
            }
            ValidationWarning::VariantWithoutComparison { variant, intent } => write!(
                f,
                "metric variant {} only applies to comparisons; the {} answer reports absolute values",
                variant, intent
            ),
        }
    }
}

/// Everything the validator found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub(crate) fn warn(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn rules(&self) -> Vec<&'static str> {
        self.errors.iter().map(ValidationError::rule).collect()
    }
}

/// A query rejected by validation, with all of its errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("query failed validation: {}", join_errors(.errors))]
pub struct ValidationFailed {
    pub errors: Vec<ValidationError>,
}

impl From<ValidationError> for ValidationFailed {
    fn from(error: ValidationError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl From<ValidationReport> for ValidationFailed {
    fn from(report: ValidationReport) -> Self {
        Self {
            errors: report.errors,
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The per-intent shape a certified query was checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum QueryShape {
    Trend {
        time_dimension: String,
    },
    Comparison,
    Ranking {
        order_by: String,
        direction: SortDirection,
        limit: u64,
    },
    Snapshot,
    Diagnostic,
}

/// A query that passed validation, with names canonicalized.
///
/// Only the validator constructs one; the security layer turns it into
/// the `SecuredQuery` the compiler accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct CertifiedQuery {
    query: StructuredQuery,
    shape: QueryShape,
    window: TimeWindow,
    warnings: Vec<ValidationWarning>,
}

impl CertifiedQuery {
    pub(crate) fn new(
        query: StructuredQuery,
        shape: QueryShape,
        window: TimeWindow,
        warnings: Vec<ValidationWarning>,
    ) -> Self {
        Self {
            query,
            shape,
            window,
            warnings,
        }
    }

    pub fn query(&self) -> &StructuredQuery {
        &self.query
    }

    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    pub(crate) fn into_parts(
        self,
    ) -> (StructuredQuery, QueryShape, TimeWindow, Vec<ValidationWarning>) {
        (self.query, self.shape, self.window, self.warnings)
    }
}
