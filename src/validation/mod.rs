//! Validation of structured queries against the registry.
//!
//! Every rule is evaluated; the report lists all violations so a caller
//! sees every problem at once. Rules, in reporting order:
//!
//! 1. the metric exists
//! 2. every referenced dimension exists and is compatible with the metric
//! 3. group-by cardinality is within bounds
//! 4. a ranking has a sort with a positive limit
//! 5. a trend groups by a time dimension
//! 6. the time window parses and suits the grain
//! 7. every filter has values valid for its operator and dimension type

mod report;

pub use report::{
    CertifiedQuery, QueryShape, ValidationError, ValidationFailed, ValidationReport,
    ValidationWarning,
};

use std::collections::BTreeSet;

use crate::config::{ValidationSettings, MAX_GROUP_BY_CEILING};
use crate::query::{Arity, Intent, MetricVariant, ResultFormat, StructuredQuery, TimeWindow};
use crate::registry::{DimensionDef, MetricDef, Registry};

/// Decode a query from JSON, reporting malformed input as a validation
/// error rather than a parser failure.
pub fn parse_query(json: &str) -> Result<StructuredQuery, ValidationError> {
    StructuredQuery::from_json(json).map_err(|e| ValidationError::MalformedInput {
        field: "$".into(),
        message: e.to_string(),
    })
}

/// Checks queries against one registry snapshot.
#[derive(Debug, Clone)]
pub struct Validator<'r> {
    registry: &'r Registry,
    settings: ValidationSettings,
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r Registry, settings: ValidationSettings) -> Self {
        Self { registry, settings }
    }

    /// Run every rule and collect errors and warnings.
    pub fn validate(&self, query: &StructuredQuery) -> ValidationReport {
        let mut report = ValidationReport::default();

        let metric = self.check_metrics(query, &mut report);
        self.check_dimensions(query, metric, &mut report);
        self.check_cardinality(query, &mut report);
        self.check_sorting(query, &mut report);
        self.check_time_dimension(query, &mut report);
        self.check_time_window(query, &mut report);
        self.check_filters(query, &mut report);
        self.check_warnings(query, &mut report);

        if report.is_valid() {
            tracing::debug!(
                intent = %query.intent,
                warnings = report.warnings.len(),
                "query passed validation"
            );
        } else {
            tracing::info!(
                intent = %query.intent,
                rules = ?report.rules(),
                "query failed validation"
            );
        }
        report
    }

    /// Same checks, but returns only the first error.
    pub fn validate_and_raise(
        &self,
        query: &StructuredQuery,
    ) -> Result<Vec<ValidationWarning>, ValidationError> {
        let report = self.validate(query);
        match report.errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(report.warnings),
        }
    }

    /// Validate and, on success, produce a canonicalized [`CertifiedQuery`].
    pub fn certify(&self, query: &StructuredQuery) -> Result<CertifiedQuery, ValidationReport> {
        let mut report = self.validate(query);
        if !report.is_valid() {
            return Err(report);
        }

        let canonical = self.canonicalize(query);
        let certified = canonical
            .time_context
            .parse_window()
            .map_err(|e| ValidationError::InvalidTimeWindow {
                field: "time_context.window".into(),
                window: canonical.time_context.window.clone(),
                reason: e.to_string(),
            })
            .and_then(|window| Ok((window, self.shape_of(&canonical)?)));

        match certified {
            Ok((window, shape)) => {
                let warnings = std::mem::take(&mut report.warnings);
                Ok(CertifiedQuery::new(canonical, shape, window, warnings))
            }
            Err(error) => {
                report.error(error);
                Err(report)
            }
        }
    }

    fn canonical_name(&self, name: &str) -> String {
        self.registry
            .synonym_of(name)
            .map(str::to_string)
            .unwrap_or_else(|| name.trim().to_lowercase())
    }

    /// Copy of the query with every name replaced by its canonical form.
    fn canonicalize(&self, query: &StructuredQuery) -> StructuredQuery {
        let mut out = query.clone();
        let request = &mut out.metric_request;
        request.primary_metric = self.canonical_name(&request.primary_metric);
        for metric in &mut request.secondary_metrics {
            *metric = self.canonical_name(metric);
        }
        for dimension in &mut out.dimensionality.group_by {
            *dimension = self.canonical_name(dimension);
        }
        for filter in &mut out.filters {
            filter.dimension = self.canonical_name(&filter.dimension);
        }
        if let Some(sorting) = &mut out.sorting {
            sorting.order_by = self.canonical_name(&sorting.order_by);
        }
        if let Ok(window) = out.time_context.parse_window() {
            out.time_context.window = window.to_string();
        }
        out
    }

    fn shape_of(&self, query: &StructuredQuery) -> Result<QueryShape, ValidationError> {
        let shape = match query.intent {
            Intent::Trend => {
                let time_dimension = query
                    .group_by_dimensions()
                    .iter()
                    .find(|d| self.time_dimension(d).is_some())
                    .cloned()
                    .ok_or_else(|| ValidationError::MissingTimeDimension {
                        field: "dimensionality.group_by".into(),
                    })?;
                QueryShape::Trend { time_dimension }
            }
            Intent::Ranking => match &query.sorting {
                Some(sorting) => match sorting.limit {
                    Some(limit) if limit > 0 => QueryShape::Ranking {
                        order_by: sorting.order_by.clone(),
                        direction: sorting.direction,
                        limit,
                    },
                    _ => return Err(missing_limit()),
                },
                None => return Err(missing_sort()),
            },
            Intent::Comparison => QueryShape::Comparison,
            Intent::Snapshot => QueryShape::Snapshot,
            Intent::Diagnostic => QueryShape::Diagnostic,
        };
        Ok(shape)
    }

    fn time_dimension(&self, name: &str) -> Option<&'r DimensionDef> {
        self.registry
            .resolve_dimension(name)
            .ok()
            .filter(|d| d.is_time())
    }

    fn is_selected_metric(&self, query: &StructuredQuery, name: &str) -> bool {
        let wanted = self.canonical_name(name);
        query.metrics().any(|m| self.canonical_name(m) == wanted)
    }

    // Rule 1, plus secondary metric checks.
    fn check_metrics(
        &self,
        query: &StructuredQuery,
        report: &mut ValidationReport,
    ) -> Option<&'r MetricDef> {
        let primary = match self.registry.resolve_metric(query.primary_metric()) {
            Ok(metric) => Some(metric),
            Err(_) => {
                report.error(ValidationError::UnknownMetric {
                    field: "metric_request.primary_metric".into(),
                    name: query.primary_metric().to_string(),
                });
                None
            }
        };

        for (i, name) in query.metric_request.secondary_metrics.iter().enumerate() {
            let field = format!("metric_request.secondary_metrics[{}]", i);
            match self.registry.resolve_metric(name) {
                Ok(metric) => {
                    if let Some(primary) = primary {
                        if metric.table != primary.table {
                            report.error(ValidationError::IncompatibleMetric {
                                field,
                                metric: metric.name.clone(),
                                primary: primary.name.clone(),
                            });
                        }
                    }
                }
                Err(_) => report.error(ValidationError::UnknownMetric {
                    field,
                    name: name.clone(),
                }),
            }
        }

        primary
    }

    // Rule 2: group-by, filter and sort dimensions.
    fn check_dimensions(
        &self,
        query: &StructuredQuery,
        metric: Option<&MetricDef>,
        report: &mut ValidationReport,
    ) {
        let incompatible = |field: String, dimension: &DimensionDef, metric: &MetricDef| {
            ValidationError::IncompatibleDimension {
                field,
                dimension: dimension.name.clone(),
                metric: metric.name.clone(),
            }
        };

        let mut seen = BTreeSet::new();
        for (i, name) in query.group_by_dimensions().iter().enumerate() {
            let field = format!("dimensionality.group_by[{}]", i);
            let Ok(dimension) = self.registry.resolve_dimension(name) else {
                report.error(ValidationError::UnknownDimension {
                    field,
                    name: name.clone(),
                });
                continue;
            };
            if !seen.insert(dimension.name.as_str()) {
                report.error(ValidationError::DuplicateDimension {
                    field: field.clone(),
                    dimension: dimension.name.clone(),
                });
            }
            if let Some(metric) = metric {
                if !dimension.is_joinable_to(&metric.table) || !metric.allows_group_by(&dimension.name)
                {
                    report.error(incompatible(field, dimension, metric));
                }
            }
        }

        for (i, filter) in query.filters.iter().enumerate() {
            let field = format!("filters[{}].dimension", i);
            match self.registry.resolve_dimension(&filter.dimension) {
                Ok(dimension) => {
                    if let Some(metric) = metric {
                        if !dimension.is_joinable_to(&metric.table) {
                            report.error(incompatible(field, dimension, metric));
                        }
                    }
                }
                Err(_) => report.error(ValidationError::UnknownDimension {
                    field,
                    name: filter.dimension.clone(),
                }),
            }
        }

        if let Some(sorting) = &query.sorting {
            if self.is_selected_metric(query, &sorting.order_by) {
                return;
            }
            let field = "sorting.order_by".to_string();
            match self.registry.resolve_dimension(&sorting.order_by) {
                Ok(dimension) => {
                    if let Some(metric) = metric {
                        if !dimension.is_joinable_to(&metric.table) {
                            report.error(incompatible(field, dimension, metric));
                        }
                    }
                }
                // An unselected metric is reported under the sort rules.
                Err(_) if self.registry.resolve_metric(&sorting.order_by).is_ok() => {}
                Err(_) => report.error(ValidationError::UnknownDimension {
                    field,
                    name: sorting.order_by.clone(),
                }),
            }
        }
    }

    // Rule 3
    fn check_cardinality(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        let count = query.group_by_dimensions().len();
        let max = self.settings.max_group_by.min(MAX_GROUP_BY_CEILING);
        if count > max {
            report.error(ValidationError::CardinalityExceeded {
                field: "dimensionality.group_by".into(),
                count,
                max,
            });
        }
    }

    // Rule 4, plus sort membership and limit range.
    fn check_sorting(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        if query.intent == Intent::Ranking {
            match &query.sorting {
                None => report.error(missing_sort()),
                Some(sorting) if sorting.limit.unwrap_or(0) == 0 => report.error(missing_limit()),
                Some(_) => {}
            }
        }

        let Some(sorting) = &query.sorting else {
            return;
        };

        if let Some(limit) = sorting.limit {
            if limit > self.settings.max_limit {
                report.error(ValidationError::LimitOutOfRange {
                    field: "sorting.limit".into(),
                    limit,
                    max: self.settings.max_limit,
                });
            }
        }

        if self.is_selected_metric(query, &sorting.order_by) {
            return;
        }
        let grouped = match self.registry.resolve_dimension(&sorting.order_by) {
            Ok(dimension) => query.group_by_dimensions().iter().any(|d| {
                self.registry
                    .resolve_dimension(d)
                    .map(|g| g.name == dimension.name)
                    .unwrap_or(false)
            }),
            Err(_) => self.registry.resolve_metric(&sorting.order_by).is_err(),
        };
        if !grouped {
            report.error(ValidationError::SortNotSelected {
                field: "sorting.order_by".into(),
                order_by: sorting.order_by.clone(),
            });
        }
    }

    // Rule 5
    fn check_time_dimension(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        if query.intent != Intent::Trend {
            return;
        }
        let has_time = query
            .group_by_dimensions()
            .iter()
            .any(|d| self.time_dimension(d).is_some());
        if !has_time {
            report.error(ValidationError::MissingTimeDimension {
                field: "dimensionality.group_by".into(),
            });
        }
    }

    // Rule 6
    fn check_time_window(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        let context = &query.time_context;
        let window: TimeWindow = match context.parse_window() {
            Ok(window) => window,
            Err(e) => {
                report.error(ValidationError::InvalidTimeWindow {
                    field: "time_context.window".into(),
                    window: context.window.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if !window.is_grain_compatible(context.grain) {
            report.error(ValidationError::InvalidTimeWindow {
                field: "time_context.grain".into(),
                window: context.window.clone(),
                reason: format!("grain '{}' is coarser than the window", context.grain),
            });
        }

        for (i, name) in query.group_by_dimensions().iter().enumerate() {
            if let Some(grain) = self.time_dimension(name).and_then(|d| d.grain) {
                if !window.is_grain_compatible(grain) {
                    report.error(ValidationError::InvalidTimeWindow {
                        field: format!("dimensionality.group_by[{}]", i),
                        window: context.window.clone(),
                        reason: format!("'{}' is coarser than the window", name),
                    });
                }
            }
        }
    }

    // Rule 7
    fn check_filters(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        for (i, filter) in query.filters.iter().enumerate() {
            let field = format!("filters[{}].values", i);
            let count = filter.values.len();
            let malformed = |reason: String| ValidationError::MalformedFilter {
                field: field.clone(),
                reason,
            };

            if count == 0 {
                report.error(malformed(format!(
                    "filter on '{}' has no values",
                    filter.dimension
                )));
                continue;
            }
            let arity_ok = match filter.operator.arity() {
                Arity::One => count == 1,
                Arity::Two => count == 2,
                Arity::AtLeastOne => true,
            };
            if !arity_ok {
                report.error(malformed(format!(
                    "operator '{}' cannot take {} values",
                    filter.operator, count
                )));
                continue;
            }

            // Unknown dimensions were reported under rule 2.
            let Ok(dimension) = self.registry.resolve_dimension(&filter.dimension) else {
                continue;
            };
            if filter.operator.is_ordering() && !dimension.value_type.is_ordered() {
                report.error(malformed(format!(
                    "operator '{}' is not valid for {} dimension '{}'",
                    filter.operator, dimension.value_type, dimension.name
                )));
                continue;
            }
            if let Some(bad) = filter
                .values
                .iter()
                .find(|v| !dimension.value_type.accepts(v))
            {
                report.error(malformed(format!(
                    "value '{}' is not a valid {} for '{}'",
                    bad, dimension.value_type, dimension.name
                )));
            }
        }
    }

    fn check_warnings(&self, query: &StructuredQuery, report: &mut ValidationReport) {
        if let Some(confidence) = query.confidence {
            let threshold = self.settings.low_confidence_threshold;
            if confidence < threshold {
                report.warn(ValidationWarning::LowConfidence {
                    confidence,
                    threshold,
                });
            }
        }
        if query.intent != Intent::Ranking
            && query.sorting.as_ref().and_then(|s| s.limit) == Some(0)
        {
            report.warn(ValidationWarning::ZeroLimit);
        }
        if query.result_shape.format == ResultFormat::Chart
            && query.group_by_dimensions().is_empty()
        {
            report.warn(ValidationWarning::ChartWithoutGroupBy);
        }
        let variant = query.metric_request.variant;
        if variant != MetricVariant::Absolute && query.intent != Intent::Comparison {
            report.warn(ValidationWarning::VariantWithoutComparison {
                variant,
                intent: query.intent,
            });
        }
    }
}

fn missing_sort() -> ValidationError {
    ValidationError::MissingSort {
        field: "sorting".into(),
        reason: "a ranking needs a sort order".into(),
    }
}

fn missing_limit() -> ValidationError {
    ValidationError::MissingSort {
        field: "sorting.limit".into(),
        reason: "a ranking needs a positive limit".into(),
    }
}
