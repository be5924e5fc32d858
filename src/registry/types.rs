//! Metric and dimension definitions.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::query::{FilterOp, FilterValue, Grain};

/// Aggregation applied to a metric's source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
}

impl Aggregation {
    /// SQL function name.
    pub fn function_name(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count | Aggregation::CountDistinct => "count",
            Aggregation::Avg => "avg",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    pub fn is_distinct(&self) -> bool {
        matches!(self, Aggregation::CountDistinct)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::CountDistinct => f.write_str("count_distinct"),
            other => f.write_str(other.function_name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFormat {
    #[default]
    Number,
    Currency,
    Percent,
}

/// Declared type of a dimension's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    String,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl ValueType {
    /// Whether a filter value can be bound against a column of this type.
    pub fn accepts(&self, value: &FilterValue) -> bool {
        match (self, value) {
            (ValueType::String, FilterValue::Text(_)) => true,
            (ValueType::Integer, FilterValue::Int(_)) => true,
            (ValueType::Decimal, FilterValue::Int(_) | FilterValue::Float(_)) => true,
            (ValueType::Boolean, FilterValue::Bool(_)) => true,
            (ValueType::Date, FilterValue::Text(s)) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            _ => false,
        }
    }

    /// Whether `<`, `>` and `between` are meaningful.
    pub fn is_ordered(&self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Decimal | ValueType::Date)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Decimal => "decimal",
            ValueType::Date => "date",
            ValueType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A fact-level predicate that is part of a metric's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactFilter {
    pub column: String,
    pub operator: FilterOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDef {
    pub name: String,
    pub description: String,
    /// Source fact table.
    pub table: String,
    pub column: String,
    pub aggregation: Aggregation,
    pub format: MetricFormat,
    /// Dimensions this metric may be grouped by. Empty means every
    /// dimension joinable to the fact.
    pub dimensions: Vec<String>,
    pub synonyms: Vec<String>,
    pub filters: Vec<FactFilter>,
}

impl MetricDef {
    /// Whether the metric's own dimension list admits `dimension`.
    pub fn allows_group_by(&self, dimension: &str) -> bool {
        self.dimensions.is_empty() || self.dimensions.iter().any(|d| d == dimension)
    }
}

/// How a dimension table joins to one fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinKey {
    pub fact: String,
    pub fact_key: String,
    pub dimension_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDef {
    pub name: String,
    pub description: String,
    pub table: String,
    pub column: String,
    pub value_type: ValueType,
    /// Set for calendar dimensions.
    pub grain: Option<Grain>,
    pub synonyms: Vec<String>,
    pub joins: Vec<JoinKey>,
}

impl DimensionDef {
    /// Join path back to `fact`, or `None` when the column lives on the
    /// fact itself.
    pub fn join_for(&self, fact: &str) -> Option<&JoinKey> {
        self.joins.iter().find(|j| j.fact == fact)
    }

    pub fn is_on_fact(&self, fact: &str) -> bool {
        self.table == fact
    }

    pub fn is_joinable_to(&self, fact: &str) -> bool {
        self.is_on_fact(fact) || self.join_for(fact).is_some()
    }

    pub fn is_time(&self) -> bool {
        self.grain.is_some()
    }
}
