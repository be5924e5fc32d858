//! Time windows, grains and date-range resolution.
//!
//! A window name such as `last_4_weeks` or `qtd` is parsed into a
//! [`TimeWindow`] and resolved against an explicit `as_of` date into a
//! half-open [`DateRange`]. Resolution never reads the wall clock, so the
//! same query compiled twice with the same `as_of` yields the same bounds.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, Days, Months, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Generic rolling windows: `last_<n>_days`, `last_<n>_weeks`, `last_<n>_months`.
static ROLLING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^last_(\d{1,4})_(day|week|month)s?$").unwrap());

/// Prefix for the window immediately before another window.
pub const PRECEDING_PREFIX: &str = "previous:";

/// Time granularity, ordered from finest to coarsest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Grain {
    #[default]
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Grain {
    pub const ALL: [Grain; 5] = [
        Grain::Day,
        Grain::Week,
        Grain::Month,
        Grain::Quarter,
        Grain::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grain::Day => "day",
            Grain::Week => "week",
            Grain::Month => "month",
            Grain::Quarter => "quarter",
            Grain::Year => "year",
        }
    }
}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing or resolving a window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("unknown time window '{0}'")]
    Unknown(String),

    #[error("time window '{0}' falls outside the supported calendar range")]
    OutOfRange(String),
}

/// A half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Number of days covered.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// True when the two ranges share at least one day.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A window that can be named in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedWindow {
    /// The last `n` days, ending on `as_of` inclusive.
    LastDays(u32),
    LastWeeks(u32),
    LastMonths(u32),
    ThisMonth,
    LastMonth,
    ThisQuarter,
    LastQuarter,
    ThisYear,
    LastYear,
    MonthToDate,
    QuarterToDate,
    YearToDate,
}

/// A window as it appears in a query's time context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    Named(NamedWindow),
    /// The comparable period immediately before the wrapped window.
    Preceding(NamedWindow),
}

impl FromStr for NamedWindow {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let window = match name.as_str() {
            "this_month" => NamedWindow::ThisMonth,
            "last_month" => NamedWindow::LastMonth,
            "this_quarter" => NamedWindow::ThisQuarter,
            "last_quarter" => NamedWindow::LastQuarter,
            "this_year" => NamedWindow::ThisYear,
            "last_year" => NamedWindow::LastYear,
            "mtd" | "month_to_date" => NamedWindow::MonthToDate,
            "qtd" | "quarter_to_date" => NamedWindow::QuarterToDate,
            "ytd" | "year_to_date" => NamedWindow::YearToDate,
            _ => {
                let caps = ROLLING_PATTERN
                    .captures(&name)
                    .ok_or_else(|| WindowError::Unknown(s.to_string()))?;
                let n: u32 = caps[1]
                    .parse()
                    .map_err(|_| WindowError::Unknown(s.to_string()))?;
                if n == 0 {
                    return Err(WindowError::Unknown(s.to_string()));
                }
                match &caps[2] {
                    "day" => NamedWindow::LastDays(n),
                    "week" => NamedWindow::LastWeeks(n),
                    _ => NamedWindow::LastMonths(n),
                }
            }
        };
        Ok(window)
    }
}

impl fmt::Display for NamedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamedWindow::LastDays(n) => write!(f, "last_{}_days", n),
            NamedWindow::LastWeeks(n) => write!(f, "last_{}_weeks", n),
            NamedWindow::LastMonths(n) => write!(f, "last_{}_months", n),
            NamedWindow::ThisMonth => f.write_str("this_month"),
            NamedWindow::LastMonth => f.write_str("last_month"),
            NamedWindow::ThisQuarter => f.write_str("this_quarter"),
            NamedWindow::LastQuarter => f.write_str("last_quarter"),
            NamedWindow::ThisYear => f.write_str("this_year"),
            NamedWindow::LastYear => f.write_str("last_year"),
            NamedWindow::MonthToDate => f.write_str("mtd"),
            NamedWindow::QuarterToDate => f.write_str("qtd"),
            NamedWindow::YearToDate => f.write_str("ytd"),
        }
    }
}

impl FromStr for TimeWindow {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().strip_prefix(PRECEDING_PREFIX) {
            Some(inner) => Ok(TimeWindow::Preceding(inner.parse()?)),
            None => Ok(TimeWindow::Named(s.parse()?)),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::Named(w) => write!(f, "{}", w),
            TimeWindow::Preceding(w) => write!(f, "{}{}", PRECEDING_PREFIX, w),
        }
    }
}

/// Calendar period a window is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Month,
    Quarter,
    Year,
}

impl Period {
    fn months(self) -> u32 {
        match self {
            Period::Month => 1,
            Period::Quarter => 3,
            Period::Year => 12,
        }
    }

    fn start_of(self, date: NaiveDate) -> Option<NaiveDate> {
        let month = match self {
            Period::Month => date.month(),
            Period::Quarter => (date.month() - 1) / 3 * 3 + 1,
            Period::Year => 1,
        };
        NaiveDate::from_ymd_opt(date.year(), month, 1)
    }
}

impl NamedWindow {
    /// Resolve against `as_of` (the last complete day of data).
    pub fn resolve(&self, as_of: NaiveDate) -> Result<DateRange, WindowError> {
        self.try_resolve(as_of)
            .ok_or_else(|| WindowError::OutOfRange(self.to_string()))
    }

    fn try_resolve(&self, as_of: NaiveDate) -> Option<DateRange> {
        let tomorrow = as_of.checked_add_days(Days::new(1))?;
        let range = match *self {
            NamedWindow::LastDays(n) => DateRange {
                start: tomorrow.checked_sub_days(Days::new(u64::from(n)))?,
                end: tomorrow,
            },
            NamedWindow::LastWeeks(n) => DateRange {
                start: tomorrow.checked_sub_days(Days::new(u64::from(n) * 7))?,
                end: tomorrow,
            },
            NamedWindow::LastMonths(n) => DateRange {
                start: tomorrow.checked_sub_months(Months::new(n))?,
                end: tomorrow,
            },
            NamedWindow::ThisMonth => Self::whole_period(Period::Month, as_of, 0)?,
            NamedWindow::LastMonth => Self::whole_period(Period::Month, as_of, 1)?,
            NamedWindow::ThisQuarter => Self::whole_period(Period::Quarter, as_of, 0)?,
            NamedWindow::LastQuarter => Self::whole_period(Period::Quarter, as_of, 1)?,
            NamedWindow::ThisYear => Self::whole_period(Period::Year, as_of, 0)?,
            NamedWindow::LastYear => Self::whole_period(Period::Year, as_of, 1)?,
            NamedWindow::MonthToDate => DateRange {
                start: Period::Month.start_of(as_of)?,
                end: tomorrow,
            },
            NamedWindow::QuarterToDate => DateRange {
                start: Period::Quarter.start_of(as_of)?,
                end: tomorrow,
            },
            NamedWindow::YearToDate => DateRange {
                start: Period::Year.start_of(as_of)?,
                end: tomorrow,
            },
        };
        Some(range)
    }

    /// The full calendar period containing `as_of`, moved back `back` periods.
    fn whole_period(period: Period, as_of: NaiveDate, back: u32) -> Option<DateRange> {
        let current = period.start_of(as_of)?;
        let start = current.checked_sub_months(Months::new(period.months() * back))?;
        let end = start.checked_add_months(Months::new(period.months()))?;
        Some(DateRange { start, end })
    }

    /// The period immediately before this window.
    ///
    /// Rolling and whole-period windows shift back by their own length, so
    /// the two ranges are contiguous. To-date windows compare against the
    /// same number of days from the start of the previous period.
    pub fn preceding(&self, as_of: NaiveDate) -> Result<DateRange, WindowError> {
        self.try_preceding(as_of)
            .ok_or_else(|| WindowError::OutOfRange(format!("{}{}", PRECEDING_PREFIX, self)))
    }

    fn try_preceding(&self, as_of: NaiveDate) -> Option<DateRange> {
        let current = self.try_resolve(as_of)?;
        let shift_months = |months: u32| -> Option<DateRange> {
            Some(DateRange {
                start: current.start.checked_sub_months(Months::new(months))?,
                end: current.start,
            })
        };
        match *self {
            NamedWindow::LastDays(_) | NamedWindow::LastWeeks(_) => Some(DateRange {
                start: current
                    .start
                    .checked_sub_days(Days::new(current.days().unsigned_abs()))?,
                end: current.start,
            }),
            NamedWindow::LastMonths(n) => shift_months(n),
            NamedWindow::ThisMonth | NamedWindow::LastMonth => shift_months(1),
            NamedWindow::ThisQuarter | NamedWindow::LastQuarter => shift_months(3),
            NamedWindow::ThisYear | NamedWindow::LastYear => shift_months(12),
            NamedWindow::MonthToDate => Self::same_days_before(Period::Month, current),
            NamedWindow::QuarterToDate => Self::same_days_before(Period::Quarter, current),
            NamedWindow::YearToDate => Self::same_days_before(Period::Year, current),
        }
    }

    fn same_days_before(period: Period, current: DateRange) -> Option<DateRange> {
        let start = current
            .start
            .checked_sub_months(Months::new(period.months()))?;
        let end = start
            .checked_add_days(Days::new(current.days().unsigned_abs()))?
            .min(current.start);
        Some(DateRange { start, end })
    }

    /// Coarsest grain at which this window still yields a meaningful series.
    pub fn coarsest_grain(&self) -> Grain {
        match *self {
            NamedWindow::LastDays(n) => match n {
                0..=6 => Grain::Day,
                7..=27 => Grain::Week,
                28..=89 => Grain::Month,
                90..=364 => Grain::Quarter,
                _ => Grain::Year,
            },
            NamedWindow::LastWeeks(n) => match n {
                0..=3 => Grain::Week,
                4..=12 => Grain::Month,
                13..=51 => Grain::Quarter,
                _ => Grain::Year,
            },
            NamedWindow::LastMonths(n) => match n {
                0..=2 => Grain::Month,
                3..=11 => Grain::Quarter,
                _ => Grain::Year,
            },
            NamedWindow::ThisMonth | NamedWindow::LastMonth | NamedWindow::MonthToDate => {
                Grain::Month
            }
            NamedWindow::ThisQuarter | NamedWindow::LastQuarter | NamedWindow::QuarterToDate => {
                Grain::Quarter
            }
            NamedWindow::ThisYear | NamedWindow::LastYear | NamedWindow::YearToDate => {
                Grain::Year
            }
        }
    }
}

impl TimeWindow {
    pub fn resolve(&self, as_of: NaiveDate) -> Result<DateRange, WindowError> {
        match self {
            TimeWindow::Named(w) => w.resolve(as_of),
            TimeWindow::Preceding(w) => w.preceding(as_of),
        }
    }

    pub fn base(&self) -> NamedWindow {
        match self {
            TimeWindow::Named(w) | TimeWindow::Preceding(w) => *w,
        }
    }

    /// Whether `grain` is no coarser than the window's natural unit.
    pub fn is_grain_compatible(&self, grain: Grain) -> bool {
        grain <= self.base().coarsest_grain()
    }
}
