//! Readable conclusions drawn from a diagnostic's numbers.

use std::fmt;

use serde::Serialize;

use crate::analysis::{DimensionBreakdown, TrendDirection, TrendSummary};

/// Top contributors reported, explaining dimension first.
const MAX_CONTRIBUTOR_INSIGHTS: usize = 3;

/// A decline steeper than this many percent calls for investigation.
const DECLINE_ALERT_PCT: f64 = 5.0;

/// Growth steeper than this many percent is worth scaling.
const GROWTH_ALERT_PCT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Insight {
    Trend {
        metric: String,
        direction: TrendDirection,
        change_pct: f64,
    },
    TopContributor {
        dimension: String,
        value: String,
        current: f64,
        delta: f64,
        share: f64,
    },
}

impl fmt::Display for Insight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insight::Trend {
                metric,
                direction,
                change_pct,
            } => match direction {
                TrendDirection::Increasing => write!(
                    f,
                    "{} increased by {:.1}% over the period",
                    metric,
                    change_pct.abs()
                ),
                TrendDirection::Decreasing => write!(
                    f,
                    "{} decreased by {:.1}% over the period",
                    metric,
                    change_pct.abs()
                ),
                TrendDirection::Stable => {
                    write!(f, "{} held steady ({:.1}%)", metric, change_pct)
                }
                TrendDirection::InsufficientData => {
                    write!(f, "too few periods to read a trend in {}", metric)
                }
            },
            Insight::TopContributor {
                dimension,
                value,
                delta,
                share,
                ..
            } => write!(
                f,
                "top contributor in {}: {} ({:+.0}, {:.0}% of the change)",
                dimension,
                value,
                delta,
                share * 100.0
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    /// Falling fast: look at the top segments for a root cause.
    InvestigateDecline { change_pct: f64 },
    /// Rising fast: find what the top performers do and repeat it.
    ScaleGrowth { change_pct: f64 },
    Monitor,
    FocusOn { dimension: String },
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::InvestigateDecline { change_pct } => write!(
                f,
                "down {:.1}%: investigate the top contributing segments and target them first",
                change_pct.abs()
            ),
            Recommendation::ScaleGrowth { change_pct } => write!(
                f,
                "up {:.1}%: study the top performers and scale what works",
                change_pct
            ),
            Recommendation::Monitor => f.write_str("monitor for significant changes"),
            Recommendation::FocusOn { dimension } => {
                write!(f, "focus further analysis on {}", dimension)
            }
        }
    }
}

/// The trend, then the top value of up to three measured dimensions.
pub(super) fn insights(
    metric: &str,
    trend: &TrendSummary,
    breakdowns: &[DimensionBreakdown],
    explaining: Option<usize>,
) -> Vec<Insight> {
    let mut out = vec![Insight::Trend {
        metric: metric.to_string(),
        direction: trend.direction,
        change_pct: trend.change_pct,
    }];

    let ordered = explaining
        .and_then(|i| breakdowns.get(i))
        .into_iter()
        .chain(
            breakdowns
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != explaining)
                .map(|(_, b)| b),
        );
    out.extend(
        ordered
            .filter_map(|b| b.top())
            .take(MAX_CONTRIBUTOR_INSIGHTS)
            .map(|top| Insight::TopContributor {
                dimension: top.dimension.clone(),
                value: top.value.clone(),
                current: top.current,
                delta: top.delta,
                share: top.share,
            }),
    );
    out
}

pub(super) fn recommendations(
    trend: &TrendSummary,
    explaining_dimension: Option<&str>,
) -> Vec<Recommendation> {
    let change_pct = trend.change_pct;
    let mut out = vec![match trend.direction {
        TrendDirection::Decreasing if change_pct.abs() > DECLINE_ALERT_PCT => {
            Recommendation::InvestigateDecline { change_pct }
        }
        TrendDirection::Increasing if change_pct > GROWTH_ALERT_PCT => {
            Recommendation::ScaleGrowth { change_pct }
        }
        _ => Recommendation::Monitor,
    }];
    if let Some(dimension) = explaining_dimension {
        out.push(Recommendation::FocusOn {
            dimension: dimension.to_string(),
        });
    }
    out
}
