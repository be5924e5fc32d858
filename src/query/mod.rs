//! The structured query: the canonical request consumed by the core.
//!
//! A [`StructuredQuery`] is produced by an upstream intent parser and
//! arrives as JSON. Deserialization is strict (unknown fields are rejected)
//! but deliberately loose on semantics: names are plain strings until the
//! validator resolves them against the registry.

pub mod time;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub use time::{DateRange, Grain, NamedWindow, TimeWindow, WindowError};

/// Default window when the parser did not supply one.
pub const DEFAULT_WINDOW: &str = "last_4_weeks";

/// High-level analytic intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Trend,
    Comparison,
    Ranking,
    Diagnostic,
    Snapshot,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Trend => "trend",
            Intent::Comparison => "comparison",
            Intent::Ranking => "ranking",
            Intent::Diagnostic => "diagnostic",
            Intent::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricVariant {
    #[default]
    Absolute,
    Growth,
    Delta,
    Contribution,
}

impl fmt::Display for MetricVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricVariant::Absolute => "absolute",
            MetricVariant::Growth => "growth",
            MetricVariant::Delta => "delta",
            MetricVariant::Contribution => "contribution",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricRequest {
    pub primary_metric: String,
    #[serde(default)]
    pub secondary_metrics: Vec<String>,
    #[serde(default, alias = "metric_variant")]
    pub variant: MetricVariant,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimensionality {
    #[serde(default)]
    pub group_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeContext {
    /// Window name, parsed during validation.
    #[serde(default = "default_window")]
    pub window: String,
    #[serde(default)]
    pub grain: Grain,
}

fn default_window() -> String {
    DEFAULT_WINDOW.to_string()
}

impl Default for TimeContext {
    fn default() -> Self {
        Self {
            window: default_window(),
            grain: Grain::Day,
        }
    }
}

impl TimeContext {
    pub fn parse_window(&self) -> Result<TimeWindow, WindowError> {
        self.window.parse()
    }
}

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=", alias = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "<>", alias = "ne")]
    Ne,
    #[serde(rename = "in", alias = "IN")]
    In,
    #[serde(rename = "not_in", alias = "NOT IN", alias = "not in")]
    NotIn,
    #[serde(rename = "between", alias = "BETWEEN")]
    Between,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
}

/// How many values an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    One,
    AtLeastOne,
    Two,
}

impl FilterOp {
    pub fn arity(&self) -> Arity {
        match self {
            FilterOp::In | FilterOp::NotIn => Arity::AtLeastOne,
            FilterOp::Between => Arity::Two,
            _ => Arity::One,
        }
    }

    /// Operators that need an ordered value type.
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            FilterOp::Gt | FilterOp::Lt | FilterOp::Gte | FilterOp::Lte | FilterOp::Between
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::In => "in",
            FilterOp::NotIn => "not_in",
            FilterOp::Between => "between",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal filter value. Never rendered into SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Int(n) => write!(f, "{}", n),
            FilterValue::Float(x) => write!(f, "{}", x),
            FilterValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Float(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub dimension: String,
    pub operator: FilterOp,
    /// Accepts a single value or a list on input.
    #[serde(alias = "value", deserialize_with = "one_or_many")]
    pub values: Vec<FilterValue>,
}

impl Filter {
    pub fn new(
        dimension: impl Into<String>,
        operator: FilterOp,
        values: impl IntoIterator<Item = FilterValue>,
    ) -> Self {
        Self {
            dimension: dimension.into(),
            operator,
            values: values.into_iter().collect(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<FilterValue>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<FilterValue>),
        One(FilterValue),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[default]
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sorting {
    pub order_by: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Table,
    Pivot,
    Chart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Line,
    Bar,
    StackedBar,
    Heatmap,
}

/// Presentation hint. Carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultShape {
    #[serde(default)]
    pub format: ResultFormat,
    #[serde(default)]
    pub chart_type: Option<ChartType>,
}

/// The canonical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredQuery {
    pub intent: Intent,
    pub metric_request: MetricRequest,
    #[serde(default)]
    pub dimensionality: Dimensionality,
    #[serde(default)]
    pub time_context: TimeContext,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sorting: Option<Sorting>,
    #[serde(default)]
    pub result_shape: ResultShape,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub original_question: Option<String>,
}

impl StructuredQuery {
    pub fn new(intent: Intent, metric: impl Into<String>) -> Self {
        Self {
            intent,
            metric_request: MetricRequest {
                primary_metric: metric.into(),
                secondary_metrics: Vec::new(),
                variant: MetricVariant::Absolute,
            },
            dimensionality: Dimensionality::default(),
            time_context: TimeContext::default(),
            filters: Vec::new(),
            sorting: None,
            result_shape: ResultShape::default(),
            confidence: None,
            original_question: None,
        }
    }

    /// Strict JSON decoding. See `validation::parse_query` for the
    /// variant that reports a validation error.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn group_by(mut self, dimension: impl Into<String>) -> Self {
        self.dimensionality.group_by.push(dimension.into());
        self
    }

    #[must_use]
    pub fn secondary_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric_request.secondary_metrics.push(metric.into());
        self
    }

    #[must_use]
    pub fn variant(mut self, variant: MetricVariant) -> Self {
        self.metric_request.variant = variant;
        self
    }

    #[must_use]
    pub fn window(mut self, window: impl Into<String>) -> Self {
        self.time_context.window = window.into();
        self
    }

    #[must_use]
    pub fn grain(mut self, grain: Grain) -> Self {
        self.time_context.grain = grain;
        self
    }

    #[must_use]
    pub fn filter(
        mut self,
        dimension: impl Into<String>,
        operator: FilterOp,
        values: impl IntoIterator<Item = FilterValue>,
    ) -> Self {
        self.filters.push(Filter::new(dimension, operator, values));
        self
    }

    #[must_use]
    pub fn sort(
        mut self,
        order_by: impl Into<String>,
        direction: SortDirection,
        limit: Option<u64>,
    ) -> Self {
        self.sorting = Some(Sorting {
            order_by: order_by.into(),
            direction,
            limit,
        });
        self
    }

    #[must_use]
    pub fn result_shape(mut self, format: ResultFormat, chart_type: Option<ChartType>) -> Self {
        self.result_shape = ResultShape { format, chart_type };
        self
    }

    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn question(mut self, question: impl Into<String>) -> Self {
        self.original_question = Some(question.into());
        self
    }

    pub fn primary_metric(&self) -> &str {
        &self.metric_request.primary_metric
    }

    /// Primary metric followed by the secondary metrics.
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.metric_request.primary_metric.as_str())
            .chain(self.metric_request.secondary_metrics.iter().map(String::as_str))
    }

    pub fn group_by_dimensions(&self) -> &[String] {
        &self.dimensionality.group_by
    }
}
