//! Secured query to query tree.

use chrono::NaiveDate;

use super::ast::{
    AggregateExpression, Clause, ColumnRef, Join, Operand, OrderItem, OrderTarget, Param,
    Predicate, QueryAst, SelectItem,
};
use super::{CompilationError, CompilationResult};
use crate::query::{Arity, FilterOp, FilterValue, StructuredQuery};
use crate::registry::{DimensionDef, MetricDef, Registry, ValueType};
use crate::security::SecuredQuery;
use crate::validation::QueryShape;

/// Builds a [`QueryAst`] from a [`SecuredQuery`].
///
/// `as_of` anchors the time window so that the same query built on the
/// same day always produces the same tree.
#[derive(Debug, Clone, Copy)]
pub struct AstBuilder<'r> {
    registry: &'r Registry,
    as_of: NaiveDate,
}

impl<'r> AstBuilder<'r> {
    pub fn new(registry: &'r Registry, as_of: NaiveDate) -> Self {
        Self { registry, as_of }
    }

    pub fn build(&self, secured: &SecuredQuery) -> CompilationResult<QueryAst> {
        let query = secured.query();
        let metric = self.registry.resolve_metric(query.primary_metric())?;
        let fact = metric.table.as_str();

        let mut joins = JoinSet::new(fact);
        let group_by = query
            .group_by_dimensions()
            .iter()
            .map(|name| self.registry.resolve_dimension(name))
            .collect::<Result<Vec<_>, _>>()?;
        for dimension in &group_by {
            joins.add(dimension)?;
        }

        let mut clauses = vec![
            Clause::Select(self.select_items(query, metric, &group_by)?),
            Clause::From(fact.to_string()),
        ];

        let predicate = self.predicate(secured, metric, &mut joins)?;
        let order = self.ordering(query, secured.shape(), &mut joins)?;

        clauses.extend(joins.into_joins().into_iter().map(Clause::Join));
        clauses.push(Clause::Filter(predicate));
        if !group_by.is_empty() {
            clauses.push(Clause::GroupBy(group_by.iter().map(|d| column_of(d)).collect()));
        }
        if let Some((items, limit)) = order {
            clauses.push(Clause::OrderBy(items));
            if let Some(limit) = limit {
                clauses.push(Clause::Limit(limit));
            }
        }

        Ok(QueryAst { clauses })
    }

    fn select_items(
        &self,
        query: &StructuredQuery,
        metric: &MetricDef,
        group_by: &[&DimensionDef],
    ) -> CompilationResult<Vec<SelectItem>> {
        let mut items: Vec<SelectItem> = group_by
            .iter()
            .map(|d| SelectItem::Column {
                column: column_of(d),
                alias: d.name.clone(),
            })
            .collect();
        items.push(aggregate(metric));
        for name in &query.metric_request.secondary_metrics {
            items.push(aggregate(self.registry.resolve_metric(name)?));
        }
        Ok(items)
    }

    /// Metric fact filters, then query filters (row-level security
    /// included), then the time window.
    fn predicate(
        &self,
        secured: &SecuredQuery,
        metric: &MetricDef,
        joins: &mut JoinSet<'_>,
    ) -> CompilationResult<Predicate> {
        let mut leaves = Vec::new();

        for filter in &metric.filters {
            let column = ColumnRef::new(&metric.table, &filter.column);
            let param = param_for(None, &filter.value, &column)?;
            leaves.push(Predicate::compare(
                column,
                filter.operator,
                operand(filter.operator, vec![param]),
            ));
        }

        for filter in &secured.query().filters {
            let dimension = self.registry.resolve_dimension(&filter.dimension)?;
            joins.add(dimension)?;
            let column = column_of(dimension);
            let params = filter
                .values
                .iter()
                .map(|v| param_for(Some(dimension.value_type), v, &column))
                .collect::<CompilationResult<Vec<_>>>()?;
            if !arity_matches(filter.operator, params.len()) {
                return Err(CompilationError::InvalidValue {
                    column: column.column,
                    reason: format!(
                        "operator '{}' cannot take {} value(s)",
                        filter.operator,
                        params.len()
                    ),
                });
            }
            leaves.push(Predicate::compare(
                column,
                filter.operator,
                operand(filter.operator, params),
            ));
        }

        let calendar = self.registry.calendar_dimension();
        joins.add(calendar)?;
        let range = secured
            .window()
            .resolve(self.as_of)
            .map_err(CompilationError::TimeWindow)?;
        let column = column_of(calendar);
        leaves.push(Predicate::compare(
            column.clone(),
            FilterOp::Gte,
            Operand::Single(Param::Date(range.start)),
        ));
        leaves.push(Predicate::compare(
            column,
            FilterOp::Lt,
            Operand::Single(Param::Date(range.end)),
        ));

        Ok(Predicate::And(leaves))
    }

    fn ordering(
        &self,
        query: &StructuredQuery,
        shape: &QueryShape,
        joins: &mut JoinSet<'_>,
    ) -> CompilationResult<Option<(Vec<OrderItem>, Option<u64>)>> {
        let (order_by, direction, limit) = match (shape, &query.sorting) {
            (
                QueryShape::Ranking {
                    order_by,
                    direction,
                    limit,
                },
                _,
            ) => (order_by.as_str(), *direction, Some(*limit)),
            (_, Some(sorting)) => (sorting.order_by.as_str(), sorting.direction, sorting.limit),
            (_, None) => return Ok(None),
        };

        let target = self.order_target(query, order_by, joins)?;
        Ok(Some((vec![OrderItem { target, direction }], limit)))
    }

    fn order_target(
        &self,
        query: &StructuredQuery,
        name: &str,
        joins: &mut JoinSet<'_>,
    ) -> CompilationResult<OrderTarget> {
        if query.metrics().any(|m| m == name) {
            return Ok(OrderTarget::Alias(name.to_string()));
        }
        let dimension = self.registry.resolve_dimension(name)?;
        joins.add(dimension)?;
        Ok(OrderTarget::Column(column_of(dimension)))
    }
}

/// Joins in first-reference order, one per dimension table.
struct JoinSet<'a> {
    fact: &'a str,
    joins: Vec<Join>,
}

impl<'a> JoinSet<'a> {
    fn new(fact: &'a str) -> Self {
        Self {
            fact,
            joins: Vec::new(),
        }
    }

    fn add(&mut self, dimension: &DimensionDef) -> CompilationResult<()> {
        if dimension.is_on_fact(self.fact) {
            return Ok(());
        }
        let key = dimension
            .join_for(self.fact)
            .ok_or_else(|| CompilationError::UnresolvableJoin {
                dimension: dimension.name.clone(),
                fact: self.fact.to_string(),
                reason: format!("no join path from '{}'", dimension.table),
            })?;

        let join = Join {
            table: dimension.table.clone(),
            on_fact: ColumnRef::new(self.fact, &key.fact_key),
            on_dimension: ColumnRef::new(&dimension.table, &key.dimension_key),
        };
        match self.joins.iter().find(|j| j.table == join.table) {
            None => self.joins.push(join),
            Some(existing) if *existing == join => {}
            Some(existing) => {
                return Err(CompilationError::UnresolvableJoin {
                    dimension: dimension.name.clone(),
                    fact: self.fact.to_string(),
                    reason: format!(
                        "'{}' is already joined on '{}', this dimension needs '{}'",
                        join.table, existing.on_fact.column, join.on_fact.column
                    ),
                });
            }
        }
        Ok(())
    }

    fn into_joins(self) -> Vec<Join> {
        self.joins
    }
}

fn column_of(dimension: &DimensionDef) -> ColumnRef {
    ColumnRef::new(&dimension.table, &dimension.column)
}

fn aggregate(metric: &MetricDef) -> SelectItem {
    SelectItem::Aggregate(AggregateExpression {
        function: metric.aggregation,
        column: ColumnRef::new(&metric.table, &metric.column),
        alias: metric.name.clone(),
    })
}

fn arity_matches(op: FilterOp, count: usize) -> bool {
    match op.arity() {
        Arity::One => count == 1,
        Arity::AtLeastOne => count >= 1,
        Arity::Two => count == 2,
    }
}

fn operand(op: FilterOp, mut params: Vec<Param>) -> Operand {
    match op.arity() {
        Arity::AtLeastOne => Operand::List(params),
        Arity::Two if params.len() == 2 => {
            let high = params.remove(1);
            let low = params.remove(0);
            Operand::Range(low, high)
        }
        _ => match params.into_iter().next() {
            Some(param) => Operand::Single(param),
            None => Operand::List(Vec::new()),
        },
    }
}

/// Convert a filter value into a bound parameter for a column of `value_type`.
fn param_for(
    value_type: Option<ValueType>,
    value: &FilterValue,
    column: &ColumnRef,
) -> CompilationResult<Param> {
    let param = match (value_type, value) {
        (Some(ValueType::Date), FilterValue::Text(text)) => {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(Param::Date)
                .map_err(|e| CompilationError::InvalidValue {
                    column: column.column.clone(),
                    reason: format!("'{}' is not a date: {}", text, e),
                })?
        }
        (_, FilterValue::Text(text)) => Param::Text(text.clone()),
        (_, FilterValue::Int(n)) => Param::Int(*n),
        (_, FilterValue::Float(x)) => Param::Float(*x),
        (_, FilterValue::Bool(b)) => Param::Bool(*b),
    };
    Ok(param)
}
