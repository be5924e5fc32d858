//! The query tree.
//!
//! A closed set of node kinds. Every renderer matches on all of them, so a
//! new clause kind cannot be added without every dialect handling it.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::query::{FilterOp, SortDirection};
use crate::registry::Aggregation;

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Param {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Text(s) => write!(f, "'{}'", s),
            Param::Int(n) => write!(f, "{}", n),
            Param::Float(x) => write!(f, "{}", x),
            Param::Bool(b) => write!(f, "{}", b),
            Param::Date(d) => write!(f, "DATE '{}'", d.format("%Y-%m-%d")),
        }
    }
}

/// A column qualified by its registry table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateExpression {
    pub function: Aggregation,
    pub column: ColumnRef,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectItem {
    Column { column: ColumnRef, alias: String },
    Aggregate(AggregateExpression),
}

impl SelectItem {
    pub fn alias(&self) -> &str {
        match self {
            SelectItem::Column { alias, .. } => alias,
            SelectItem::Aggregate(agg) => &agg.alias,
        }
    }
}

/// `LEFT JOIN table ON fact.key = table.key`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Join {
    pub table: String,
    pub on_fact: ColumnRef,
    pub on_dimension: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Single(Param),
    List(Vec<Param>),
    Range(Param, Param),
}

/// A filter predicate. `And` and `Or` nest; comparisons are leaves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Comparison {
        column: ColumnRef,
        op: FilterOp,
        operand: Operand,
    },
}

impl Predicate {
    pub fn compare(column: ColumnRef, op: FilterOp, operand: Operand) -> Self {
        Predicate::Comparison {
            column,
            op,
            operand,
        }
    }

    /// Number of comparison leaves.
    pub fn leaf_count(&self) -> usize {
        match self {
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().map(Predicate::leaf_count).sum()
            }
            Predicate::Comparison { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTarget {
    /// A select alias, used for aggregates.
    Alias(String),
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub target: OrderTarget,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Select(Vec<SelectItem>),
    From(String),
    Join(Join),
    Filter(Predicate),
    GroupBy(Vec<ColumnRef>),
    OrderBy(Vec<OrderItem>),
    Limit(u64),
}

/// A built query: clauses in the order the builder produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryAst {
    pub clauses: Vec<Clause>,
}

impl QueryAst {
    pub fn select_items(&self) -> &[SelectItem] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::Select(items) => Some(items.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn from_table(&self) -> Option<&str> {
        self.clauses.iter().find_map(|c| match c {
            Clause::From(table) => Some(table.as_str()),
            _ => None,
        })
    }

    pub fn joins(&self) -> impl Iterator<Item = &Join> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Join(join) => Some(join),
            _ => None,
        })
    }

    pub fn filter(&self) -> Option<&Predicate> {
        self.clauses.iter().find_map(|c| match c {
            Clause::Filter(p) => Some(p),
            _ => None,
        })
    }

    pub fn group_by(&self) -> &[ColumnRef] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::GroupBy(cols) => Some(cols.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn order_by(&self) -> &[OrderItem] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::OrderBy(items) => Some(items.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn limit(&self) -> Option<u64> {
        self.clauses.iter().find_map(|c| match c {
            Clause::Limit(n) => Some(*n),
            _ => None,
        })
    }
}
