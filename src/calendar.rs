use anyhow::{anyhow, Result};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// How often the engine re-derives target positions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebalancingFrequency {
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

impl RebalancingFrequency {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "m" => Ok(Self::Monthly),
            "quarterly" | "q" => Ok(Self::Quarterly),
            "yearly" | "annual" | "y" => Ok(Self::Yearly),
            other => Err(anyhow!(
                "rebalancing_freq must be monthly, quarterly or yearly (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    fn months_per_step(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Yearly => 12,
        }
    }

    fn is_anchor_month(self, month: u32) -> bool {
        match self {
            Self::Monthly => true,
            Self::Quarterly => (month - 1) % 3 == 0,
            Self::Yearly => month == 1,
        }
    }
}

/// Calendar-anchor dates (first day of month, quarter or year) inside `[start, end]`.
pub fn rebalancing_dates(
    start: NaiveDate,
    end: NaiveDate,
    frequency: RebalancingFrequency,
) -> Vec<NaiveDate> {
    let mut anchors = Vec::new();
    if end < start {
        return anchors;
    }

    let mut year = start.year();
    let mut month = start.month();
    while !frequency.is_anchor_month(month) {
        (year, month) = next_month(year, month);
    }
    let Some(mut current) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return anchors;
    };
    if current < start {
        (year, month) = add_months(year, month, frequency.months_per_step());
        match NaiveDate::from_ymd_opt(year, month, 1) {
            Some(date) => current = date,
            None => return anchors,
        }
    }

    while current <= end {
        anchors.push(current);
        (year, month) = add_months(year, month, frequency.months_per_step());
        match NaiveDate::from_ymd_opt(year, month, 1) {
            Some(date) => current = date,
            None => break,
        }
    }

    anchors
}

/// True when `date` lies within one calendar day of any anchor. `anchors` must be sorted.
pub fn is_near_anchor(date: NaiveDate, anchors: &[NaiveDate]) -> bool {
    let earliest = date - Duration::days(1);
    let latest = date + Duration::days(1);
    let idx = anchors.partition_point(|anchor| *anchor < earliest);
    anchors.get(idx).is_some_and(|anchor| *anchor <= latest)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn add_months(year: i32, month: u32, months: u32) -> (i32, u32) {
    let zero_based = (month - 1) + months;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

/// Resampling bucket for period statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplePeriod {
    Month,
    Year,
}

/// Sort key identifying the bucket that `date` falls into.
pub fn period_key(date: NaiveDate, period: ResamplePeriod) -> (i32, u32) {
    match period {
        ResamplePeriod::Month => (date.year(), date.month()),
        ResamplePeriod::Year => (date.year(), 0),
    }
}
