use crate::error::SolverError;
use crate::models::DatedSeries;
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Periodic returns laid out as `dates x symbols`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnsMatrix {
    symbols: Vec<String>,
    dates: Vec<NaiveDate>,
    values: DMatrix<f64>,
}

impl ReturnsMatrix {
    pub fn new(
        symbols: Vec<String>,
        dates: Vec<NaiveDate>,
        values: DMatrix<f64>,
    ) -> Result<Self, SolverError> {
        if values.ncols() != symbols.len() || values.nrows() != dates.len() {
            return Err(SolverError::InvalidInput(format!(
                "returns matrix is {}x{} but {} dates and {} symbols were given",
                values.nrows(),
                values.ncols(),
                dates.len(),
                symbols.len()
            )));
        }
        if values.iter().any(|value| !value.is_finite()) {
            return Err(SolverError::InvalidInput(
                "returns matrix contains non-finite values".to_string(),
            ));
        }
        Ok(Self {
            symbols,
            dates,
            values,
        })
    }

    /// Builds a matrix from one return column per symbol. Dates default to a
    /// synthetic daily sequence when the caller has none.
    pub fn from_columns(symbols: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self, SolverError> {
        let n_periods = columns.first().map(|column| column.len()).unwrap_or(0);
        if columns.iter().any(|column| column.len() != n_periods) {
            return Err(SolverError::InvalidInput(
                "return columns have different lengths".to_string(),
            ));
        }
        let values = DMatrix::from_fn(n_periods, columns.len(), |row, col| columns[col][row]);
        let origin = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default();
        let dates = (0..n_periods)
            .map(|offset| origin + chrono::Duration::days(offset as i64))
            .collect();
        Self::new(symbols, dates, values)
    }

    /// Close-to-close returns over the dates every symbol has a price for.
    /// Returns `None` when fewer than two common dates exist.
    pub fn from_prices(closes: &BTreeMap<String, DatedSeries>) -> Option<Self> {
        if closes.is_empty() {
            return None;
        }
        let mut common: Option<BTreeSet<NaiveDate>> = None;
        for series in closes.values() {
            let dates: BTreeSet<NaiveDate> = series.iter().map(|(date, _)| *date).collect();
            common = Some(match common {
                Some(existing) => existing.intersection(&dates).copied().collect(),
                None => dates,
            });
        }
        let common: Vec<NaiveDate> = common?.into_iter().collect();
        if common.len() < 2 {
            return None;
        }

        let symbols: Vec<String> = closes.keys().cloned().collect();
        let mut columns = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let by_date: BTreeMap<NaiveDate, f64> = closes[symbol].iter().copied().collect();
            let prices: Vec<f64> = common.iter().map(|date| by_date[date]).collect();
            let column: Vec<f64> = prices
                .windows(2)
                .map(|pair| {
                    if pair[0] > 0.0 {
                        pair[1] / pair[0] - 1.0
                    } else {
                        0.0
                    }
                })
                .collect();
            columns.push(column);
        }

        let n_periods = common.len() - 1;
        let values = DMatrix::from_fn(n_periods, symbols.len(), |row, col| columns[col][row]);
        Self::new(symbols, common[1..].to_vec(), values).ok()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn n_periods(&self) -> usize {
        self.dates.len()
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.values.column(index).iter().copied().collect()
    }

    pub fn mean_returns(&self) -> DVector<f64> {
        let n = self.n_periods();
        if n == 0 {
            return DVector::zeros(self.n_assets());
        }
        DVector::from_fn(self.n_assets(), |col, _| {
            self.values.column(col).sum() / n as f64
        })
    }

    /// Sample covariance (n - 1 denominator). All zeros with fewer than two periods.
    pub fn covariance(&self) -> DMatrix<f64> {
        let n = self.n_periods();
        let k = self.n_assets();
        if n < 2 {
            return DMatrix::zeros(k, k);
        }
        let means = self.mean_returns();
        let mut centered = self.values.clone();
        for (col, mean) in means.iter().enumerate() {
            for value in centered.column_mut(col).iter_mut() {
                *value -= mean;
            }
        }
        (centered.transpose() * centered) / (n as f64 - 1.0)
    }

    pub fn volatilities(&self) -> DVector<f64> {
        self.covariance().diagonal().map(|variance| variance.max(0.0).sqrt())
    }

    pub fn portfolio_returns(&self, weights: &DVector<f64>) -> Vec<f64> {
        if weights.len() != self.n_assets() {
            return Vec::new();
        }
        (&self.values * weights).iter().copied().collect()
    }

    pub fn row(&self, index: usize) -> Vec<f64> {
        self.values.row(index).iter().copied().collect()
    }

    /// Column subset in the order given. `None` if any symbol is absent.
    pub fn select(&self, symbols: &[String]) -> Option<Self> {
        let indices: Vec<usize> = symbols
            .iter()
            .map(|symbol| self.symbols.iter().position(|s| s == symbol))
            .collect::<Option<_>>()?;
        let values = DMatrix::from_fn(self.n_periods(), indices.len(), |row, col| {
            self.values[(row, indices[col])]
        });
        Self::new(symbols.to_vec(), self.dates.clone(), values).ok()
    }
}
