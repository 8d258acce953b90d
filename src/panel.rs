use crate::error::EngineError;
use crate::models::DatedSeries;
use crate::returns::ReturnsMatrix;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One `(date, symbol)` row of the merged price/fundamental panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fundamentals: BTreeMap<String, f64>,
}

impl PriceBar {
    pub fn new(
        date: NaiveDate,
        symbol: impl Into<String>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            date,
            symbol: symbol.into(),
            open,
            high,
            low,
            close,
            volume,
            fundamentals: BTreeMap::new(),
        }
    }

    /// Flat bar where every price equals `close`.
    pub fn flat(date: NaiveDate, symbol: impl Into<String>, close: f64) -> Self {
        Self::new(date, symbol, close, close, close, close, 0.0)
    }

    pub fn with_fundamental(mut self, key: &str, value: f64) -> Self {
        self.fundamentals.insert(key.to_string(), value);
        self
    }

    pub fn fundamental(&self, key: &str) -> Option<f64> {
        self.fundamentals
            .get(key)
            .copied()
            .filter(|value| value.is_finite())
    }

    fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidRow {
            date: self.date,
            symbol: self.symbol.clone(),
            reason: reason.to_string(),
        };
        if self.symbol.trim().is_empty() {
            return Err(invalid("empty symbol"));
        }
        if !(self.close.is_finite() && self.close > 0.0) {
            return Err(invalid("close must be a positive number"));
        }
        if ![self.open, self.high, self.low].iter().all(|v| v.is_finite()) {
            return Err(invalid("open/high/low must be finite"));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(invalid("volume must be a non-negative number"));
        }
        Ok(())
    }
}

/// Price panel sorted by date then symbol with unique `(date, symbol)` keys.
#[derive(Debug, Clone, Default)]
pub struct PricePanel {
    rows: Vec<PriceBar>,
    dates: Vec<NaiveDate>,
    date_offsets: Vec<usize>,
}

impl PricePanel {
    pub fn new(mut rows: Vec<PriceBar>) -> Result<Self, EngineError> {
        for row in &rows {
            row.validate()?;
        }
        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
        for pair in rows.windows(2) {
            if pair[0].date == pair[1].date && pair[0].symbol == pair[1].symbol {
                return Err(EngineError::DuplicateRow {
                    date: pair[1].date,
                    symbol: pair[1].symbol.clone(),
                });
            }
        }
        Ok(Self::from_sorted(rows))
    }

    fn from_sorted(rows: Vec<PriceBar>) -> Self {
        let mut dates = Vec::new();
        let mut date_offsets = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            if dates.last() != Some(&row.date) {
                dates.push(row.date);
                date_offsets.push(idx);
            }
        }
        Self {
            rows,
            dates,
            date_offsets,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[PriceBar] {
        &self.rows
    }

    pub fn trading_dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| row.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rows with `start <= date <= end`.
    pub fn filter_dates(&self, start: NaiveDate, end: NaiveDate) -> PricePanel {
        let lo = self.rows.partition_point(|row| row.date < start);
        let hi = self.rows.partition_point(|row| row.date <= end);
        if lo >= hi {
            return PricePanel::default();
        }
        Self::from_sorted(self.rows[lo..hi].to_vec())
    }

    pub fn bars_on(&self, date: NaiveDate) -> &[PriceBar] {
        let Ok(idx) = self.dates.binary_search(&date) else {
            return &[];
        };
        let start = self.date_offsets[idx];
        let end = self
            .date_offsets
            .get(idx + 1)
            .copied()
            .unwrap_or(self.rows.len());
        &self.rows[start..end]
    }

    pub fn close_series(&self, symbol: &str) -> DatedSeries {
        self.rows
            .iter()
            .filter(|row| row.symbol == symbol)
            .map(|row| (row.date, row.close))
            .collect()
    }

    /// Trailing view of at most `lookback_days` calendar days ending at `as_of`.
    /// Rows dated after `as_of` are never part of the view.
    pub fn window(&self, as_of: NaiveDate, lookback_days: usize) -> PanelWindow<'_> {
        let start = as_of - Duration::days(lookback_days as i64);
        let lo = self.rows.partition_point(|row| row.date < start);
        let hi = self.rows.partition_point(|row| row.date <= as_of);
        let rows: &[PriceBar] = if lo < hi { &self.rows[lo..hi] } else { &[] };
        PanelWindow { as_of, start, rows }
    }
}

/// Read-only slice of the panel handed to strategies on a rebalance date.
#[derive(Debug, Clone, Copy)]
pub struct PanelWindow<'a> {
    as_of: NaiveDate,
    start: NaiveDate,
    rows: &'a [PriceBar],
}

impl<'a> PanelWindow<'a> {
    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn rows(&self) -> &'a [PriceBar] {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of distinct trading dates in the window.
    pub fn trading_days(&self) -> usize {
        let mut count = 0;
        let mut last = None;
        for row in self.rows {
            if last != Some(row.date) {
                count += 1;
                last = Some(row.date);
            }
        }
        count
    }

    pub fn symbols(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| row.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Most recent bar per symbol inside the window.
    pub fn latest_bars(&self) -> BTreeMap<&'a str, &'a PriceBar> {
        let mut latest = BTreeMap::new();
        for row in self.rows {
            latest.insert(row.symbol.as_str(), row);
        }
        latest
    }

    pub fn closes_by_symbol(&self) -> BTreeMap<String, DatedSeries> {
        let mut grouped: BTreeMap<String, DatedSeries> = BTreeMap::new();
        for row in self.rows {
            grouped
                .entry(row.symbol.clone())
                .or_default()
                .push((row.date, row.close));
        }
        grouped
    }

    pub fn close_series(&self, symbol: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter(|row| row.symbol == symbol)
            .map(|row| row.close)
            .collect()
    }

    /// Daily returns of `symbols` (or every symbol when `None`) aligned on common dates.
    pub fn returns_matrix(&self, symbols: Option<&[String]>) -> Option<ReturnsMatrix> {
        let mut closes = self.closes_by_symbol();
        if let Some(selected) = symbols {
            closes.retain(|symbol, _| selected.contains(symbol));
        }
        ReturnsMatrix::from_prices(&closes)
    }
}

/// Source of the materialized price panel for a backtest run.
pub trait DataProvider {
    fn load_panel(&self, start: NaiveDate, end: NaiveDate) -> Result<PricePanel, EngineError>;
}

/// Provider over a panel that is already fully in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataProvider {
    panel: PricePanel,
}

impl InMemoryDataProvider {
    pub fn new(panel: PricePanel) -> Self {
        Self { panel }
    }

    pub fn from_rows(rows: Vec<PriceBar>) -> Result<Self, EngineError> {
        Ok(Self::new(PricePanel::new(rows)?))
    }
}

impl DataProvider for InMemoryDataProvider {
    fn load_panel(&self, start: NaiveDate, end: NaiveDate) -> Result<PricePanel, EngineError> {
        Ok(self.panel.filter_dates(start, end))
    }
}
