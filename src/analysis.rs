//! Post-execution analysis over result rows.
//!
//! Rows are JSON records keyed by select alias. Metric cells may arrive as
//! numbers or as numeric strings (decimal columns often do); anything else
//! counts as zero.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::query::MetricVariant;

pub type Row = Map<String, Value>;

/// Relative change below which a trend counts as flat.
pub const STABLE_THRESHOLD: f64 = 0.01;

/// One dimension value's part in the change of a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributionShare {
    pub dimension: String,
    pub value: String,
    pub current: f64,
    pub prior: f64,
    pub delta: f64,
    /// `delta / total delta`; 0 when the total did not move.
    pub share: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

/// A current/prior pairing for one dimension key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub key: Vec<String>,
    pub current: f64,
    pub prior: f64,
    pub delta: f64,
    /// `delta / prior`; `None` when the prior value is zero.
    pub growth: Option<f64>,
}

pub fn metric_value(row: &Row, metric: &str) -> f64 {
    match row.get(metric) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn cell_text(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn totals_by_key(rows: &[Row], keys: &[&str], metric: &str) -> BTreeMap<Vec<String>, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        let key = keys.iter().map(|k| cell_text(row, k)).collect();
        *totals.entry(key).or_insert(0.0) += metric_value(row, metric);
    }
    totals
}

/// Each value of `dimension` ranked by its share of the total change.
pub fn contributions(
    dimension: &str,
    current: &[Row],
    prior: &[Row],
    metric: &str,
) -> Vec<ContributionShare> {
    let now = totals_by_key(current, &[dimension], metric);
    let before = totals_by_key(prior, &[dimension], metric);

    let mut values: Vec<&Vec<String>> = now.keys().chain(before.keys()).collect();
    values.sort();
    values.dedup();

    let mut shares: Vec<ContributionShare> = values
        .into_iter()
        .map(|key| {
            let current = now.get(key).copied().unwrap_or(0.0);
            let prior = before.get(key).copied().unwrap_or(0.0);
            ContributionShare {
                dimension: dimension.to_string(),
                value: key.concat(),
                current,
                prior,
                delta: current - prior,
                share: 0.0,
            }
        })
        .collect();

    let total = total_delta(&shares);
    if total != 0.0 {
        for share in &mut shares {
            share.share = share.delta / total;
        }
    }
    shares.sort_by(|a, b| {
        b.share
            .total_cmp(&a.share)
            .then_with(|| a.value.cmp(&b.value))
    });
    shares
}

pub fn total_delta(shares: &[ContributionShare]) -> f64 {
    shares.iter().map(|s| s.delta).sum()
}

/// Contribution analysis of one candidate dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionBreakdown {
    pub dimension: String,
    pub total_delta: f64,
    /// Ranked as [`contributions`] ranks them.
    pub shares: Vec<ContributionShare>,
}

impl DimensionBreakdown {
    pub fn new(dimension: &str, current: &[Row], prior: &[Row], metric: &str) -> Self {
        let shares = contributions(dimension, current, prior, metric);
        Self {
            dimension: dimension.to_string(),
            total_delta: total_delta(&shares),
            shares,
        }
    }

    pub fn top(&self) -> Option<&ContributionShare> {
        self.shares.first()
    }

    /// Distance between the top value's delta and the total delta.
    pub fn gap(&self) -> Option<f64> {
        self.top().map(|top| (top.delta - self.total_delta).abs())
    }
}

/// Index of the breakdown whose top value accounts for the total change
/// most closely. Earlier breakdowns win ties.
///
/// A dimension with a single value trivially matches the total, so it is
/// only chosen when no dimension splits the metric at all.
pub fn most_explaining(breakdowns: &[DimensionBreakdown]) -> Option<usize> {
    let closest = |min_values: usize| {
        breakdowns
            .iter()
            .enumerate()
            .filter(|(_, b)| b.shares.len() >= min_values)
            .filter_map(|(i, b)| b.gap().map(|gap| (i, gap)))
            .fold(None, |best: Option<(usize, f64)>, (i, gap)| match best {
                Some((_, best_gap)) if best_gap <= gap => best,
                _ => Some((i, gap)),
            })
            .map(|(i, _)| i)
    };
    closest(2).or_else(|| closest(1))
}

/// One bucket of a trend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub period: String,
    pub value: f64,
}

/// Shape of a time-ordered series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub direction: TrendDirection,
    /// Percent change from the first bucket to the last, to two decimals;
    /// 0 when the first bucket is zero.
    pub change_pct: f64,
    pub first: Option<TrendPoint>,
    pub last: Option<TrendPoint>,
    pub peak: Option<TrendPoint>,
    pub trough: Option<TrendPoint>,
    pub data_points: usize,
}

impl TrendSummary {
    pub fn empty() -> Self {
        Self {
            direction: TrendDirection::InsufficientData,
            change_pct: 0.0,
            first: None,
            last: None,
            peak: None,
            trough: None,
            data_points: 0,
        }
    }
}

/// Summarize a series already ordered by `period`.
pub fn summarize_trend(rows: &[Row], period: &str, metric: &str) -> TrendSummary {
    let points: Vec<TrendPoint> = rows
        .iter()
        .map(|row| TrendPoint {
            period: cell_text(row, period),
            value: metric_value(row, metric),
        })
        .collect();

    let direction = trend_direction(rows, metric);
    let change_pct = match (points.first(), points.last()) {
        (Some(first), Some(last)) if points.len() >= 2 && first.value != 0.0 => {
            ((last.value - first.value) / first.value * 10_000.0).round() / 100.0
        }
        _ => 0.0,
    };
    // The earliest bucket wins a tie for peak or trough.
    let extreme = |better: fn(f64, f64) -> bool| {
        points
            .iter()
            .fold(None, |best: Option<&TrendPoint>, p| match best {
                Some(b) if !better(p.value, b.value) => Some(b),
                _ => Some(p),
            })
            .cloned()
    };

    TrendSummary {
        direction,
        change_pct,
        first: points.first().cloned(),
        last: points.last().cloned(),
        peak: extreme(|a, b| a > b),
        trough: extreme(|a, b| a < b),
        data_points: points.len(),
    }
}

/// Direction of a time-ordered series, first bucket against last.
pub fn trend_direction(rows: &[Row], metric: &str) -> TrendDirection {
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return TrendDirection::InsufficientData;
    };
    if rows.len() < 2 {
        return TrendDirection::InsufficientData;
    }
    let first = metric_value(first, metric);
    let last = metric_value(last, metric);
    let change = if first == 0.0 {
        last
    } else {
        (last - first) / first.abs()
    };
    if change.abs() < STABLE_THRESHOLD {
        TrendDirection::Stable
    } else if change > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    }
}

/// Whether the coarse total change agrees with the trend.
pub fn trend_confirmed(direction: TrendDirection, total_delta: f64) -> bool {
    match direction {
        TrendDirection::Increasing => total_delta > 0.0,
        TrendDirection::Decreasing => total_delta < 0.0,
        TrendDirection::Stable | TrendDirection::InsufficientData => false,
    }
}

/// Confidence in the top contributor as a root cause.
pub fn confidence(shares: &[ContributionShare], confirmed: bool) -> f64 {
    if total_delta(shares) == 0.0 {
        return 0.0;
    }
    let top = shares.first().map_or(0.0, |s| s.share.abs().clamp(0.0, 1.0));
    if confirmed {
        top
    } else {
        top / 2.0
    }
}

/// Pair current and prior rows by their dimension key.
pub fn compare(current: &[Row], prior: &[Row], keys: &[&str], metric: &str) -> Vec<ComparisonRow> {
    let now = totals_by_key(current, keys, metric);
    let before = totals_by_key(prior, keys, metric);

    let mut all: Vec<&Vec<String>> = now.keys().chain(before.keys()).collect();
    all.sort();
    all.dedup();

    all.into_iter()
        .map(|key| {
            let current = now.get(key).copied().unwrap_or(0.0);
            let prior = before.get(key).copied().unwrap_or(0.0);
            let delta = current - prior;
            ComparisonRow {
                key: key.clone(),
                current,
                prior,
                delta,
                growth: (prior != 0.0).then(|| delta / prior),
            }
        })
        .collect()
}

/// Order paired rows the way the requested variant reads them.
///
/// `Absolute` keeps key order. `Growth` puts keys without a prior value
/// last. `Contribution` ranks by the size of the move in either direction.
pub fn order_by_variant(rows: &mut [ComparisonRow], variant: MetricVariant) {
    let desc = |a: f64, b: f64| b.total_cmp(&a);
    match variant {
        MetricVariant::Absolute => rows.sort_by(|a, b| a.key.cmp(&b.key)),
        MetricVariant::Growth => rows.sort_by(|a, b| match (a.growth, b.growth) {
            (Some(x), Some(y)) => desc(x, y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.key.cmp(&b.key),
        }),
        MetricVariant::Delta => rows.sort_by(|a, b| desc(a.delta, b.delta)),
        MetricVariant::Contribution => rows.sort_by(|a, b| desc(a.delta.abs(), b.delta.abs())),
    }
}
