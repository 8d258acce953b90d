use crate::config::StrategyConfig;
use crate::error::{ConstraintWarning, TradeRejection};
use crate::models::{Position, PortfolioSnapshot, Trade, TradeAction, WeightMap};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Advisory position limits checked after each rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioLimits {
    pub max_positions: usize,
    pub max_position_size: f64,
    pub min_position_size: f64,
}

impl Default for PortfolioLimits {
    fn default() -> Self {
        Self {
            max_positions: usize::MAX,
            max_position_size: 1.0,
            min_position_size: 0.0,
        }
    }
}

impl From<&StrategyConfig> for PortfolioLimits {
    fn from(config: &StrategyConfig) -> Self {
        Self {
            max_positions: config.max_positions,
            max_position_size: config.max_position_size,
            min_position_size: config.min_position_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub cash: f64,
    pub open_positions: usize,
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub total_commission: f64,
    pub realized_pnl: f64,
}

/// Cash, positions and the append-only trade and snapshot logs of one run.
#[derive(Debug, Clone)]
pub struct Portfolio {
    initial_cash: f64,
    cash: f64,
    commission_rate: f64,
    limits: PortfolioLimits,
    positions: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    snapshots: Vec<PortfolioSnapshot>,
    realized_pnl: f64,
    total_commission: f64,
}

impl Portfolio {
    pub fn new(initial_cash: f64, commission_rate: f64) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            commission_rate,
            limits: PortfolioLimits::default(),
            positions: BTreeMap::new(),
            trades: Vec::new(),
            snapshots: Vec::new(),
            realized_pnl: 0.0,
            total_commission: 0.0,
        }
    }

    pub fn with_limits(mut self, limits: PortfolioLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_rate
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn shares_of(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).map(|p| p.shares).unwrap_or(0)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn snapshots(&self) -> &[PortfolioSnapshot] {
        &self.snapshots
    }

    /// Buys up to `shares` at `price`. When cash cannot cover the order plus
    /// commission the quantity shrinks to the largest affordable whole number;
    /// returns `false` only when not even one share is affordable or the input
    /// is unusable.
    pub fn buy(
        &mut self,
        date: NaiveDate,
        symbol: &str,
        shares: u64,
        price: f64,
        reason: &str,
    ) -> bool {
        match self.try_buy(date, symbol, shares, price, reason) {
            Ok(()) => true,
            Err(rejection) => {
                debug!("Buy {} x{} skipped: {}", symbol, shares, rejection);
                false
            }
        }
    }

    fn try_buy(
        &mut self,
        date: NaiveDate,
        symbol: &str,
        shares: u64,
        price: f64,
        reason: &str,
    ) -> Result<(), TradeRejection> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeRejection::InvalidPrice(price));
        }
        if shares == 0 {
            return Err(TradeRejection::ZeroQuantity);
        }

        let unit_cost = price * (1.0 + self.commission_rate);
        let mut quantity = shares;
        if quantity as f64 * unit_cost > self.cash {
            let affordable = (self.cash / unit_cost).floor();
            if affordable < 1.0 {
                return Err(TradeRejection::InsufficientCash {
                    available: self.cash,
                    unit_cost,
                });
            }
            quantity = (affordable as u64).min(shares);
            // Guard against the floor landing one share over after rounding.
            if quantity as f64 * unit_cost > self.cash {
                quantity -= 1;
            }
            if quantity == 0 {
                return Err(TradeRejection::InsufficientCash {
                    available: self.cash,
                    unit_cost,
                });
            }
            debug!(
                "Resized buy of {} from {} to {} shares to fit cash {:.2}",
                symbol, shares, quantity, self.cash
            );
        }

        let cost = quantity as f64 * price;
        let commission = cost * self.commission_rate;
        self.cash -= cost + commission;
        self.total_commission += commission;

        self.positions
            .entry(symbol.to_string())
            .and_modify(|position| {
                let held = position.shares as f64;
                position.avg_cost =
                    (position.avg_cost * held + price * quantity as f64) / (held + quantity as f64);
                position.shares += quantity;
            })
            .or_insert_with(|| Position::opened(symbol, quantity, price));

        self.trades.push(Trade {
            date,
            symbol: symbol.to_string(),
            action: TradeAction::Buy,
            shares: quantity,
            price,
            total_value: cost,
            commission,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Sells up to `shares`, clamped to the held quantity. The position is
    /// removed once it reaches zero shares.
    pub fn sell(
        &mut self,
        date: NaiveDate,
        symbol: &str,
        shares: u64,
        price: f64,
        reason: &str,
    ) -> bool {
        match self.try_sell(date, symbol, shares, price, reason) {
            Ok(()) => true,
            Err(rejection) => {
                debug!("Sell {} x{} skipped: {}", symbol, shares, rejection);
                false
            }
        }
    }

    fn try_sell(
        &mut self,
        date: NaiveDate,
        symbol: &str,
        shares: u64,
        price: f64,
        reason: &str,
    ) -> Result<(), TradeRejection> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeRejection::InvalidPrice(price));
        }
        if shares == 0 {
            return Err(TradeRejection::ZeroQuantity);
        }
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| TradeRejection::NoPosition(symbol.to_string()))?;

        let quantity = shares.min(position.shares);
        let proceeds = quantity as f64 * price;
        let commission = proceeds * self.commission_rate;
        let realized = (price - position.avg_cost) * quantity as f64 - commission;

        position.shares -= quantity;
        if position.shares == 0 {
            self.positions.remove(symbol);
        }

        self.cash += proceeds - commission;
        self.total_commission += commission;
        self.realized_pnl += realized;
        self.trades.push(Trade {
            date,
            symbol: symbol.to_string(),
            action: TradeAction::Sell,
            shares: quantity,
            price,
            total_value: proceeds,
            commission,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Moves holdings to `target_positions` share counts. Every sell runs before
    /// any buy so that freed cash is available to the buys. Symbols without a
    /// price are left untouched. Returns the number of executed trades.
    pub fn rebalance_to_target(
        &mut self,
        date: NaiveDate,
        target_positions: &BTreeMap<String, u64>,
        current_prices: &HashMap<String, f64>,
    ) -> usize {
        let symbols: BTreeSet<String> = self
            .positions
            .keys()
            .chain(target_positions.keys())
            .cloned()
            .collect();

        let mut executed = 0;
        for symbol in &symbols {
            let held = self.shares_of(symbol);
            let target = target_positions.get(symbol).copied().unwrap_or(0);
            if held <= target {
                continue;
            }
            let Some(price) = current_prices.get(symbol).copied() else {
                debug!("No price for {} on {}; keeping {} shares", symbol, date, held);
                continue;
            };
            if self.sell(date, symbol, held - target, price, "rebalance") {
                executed += 1;
            }
        }

        for symbol in &symbols {
            let held = self.shares_of(symbol);
            let target = target_positions.get(symbol).copied().unwrap_or(0);
            if target <= held {
                continue;
            }
            let Some(price) = current_prices.get(symbol).copied() else {
                debug!("No price for {} on {}; skipping buy", symbol, date);
                continue;
            };
            if self.buy(date, symbol, target - held, price, "rebalance") {
                executed += 1;
            }
        }

        executed
    }

    /// Cash plus the market value of positions priced in `prices`. Positions
    /// without a price contribute nothing.
    pub fn get_total_value(&self, prices: &HashMap<String, f64>) -> f64 {
        self.cash
            + self
                .positions
                .values()
                .filter_map(|position| {
                    prices
                        .get(&position.symbol)
                        .map(|price| position.shares as f64 * price)
                })
                .sum::<f64>()
    }

    pub fn current_weights(&self, prices: &HashMap<String, f64>) -> WeightMap {
        let total = self.get_total_value(prices);
        if total <= 0.0 {
            return WeightMap::new();
        }
        self.positions
            .values()
            .filter_map(|position| {
                prices
                    .get(&position.symbol)
                    .map(|price| (position.symbol.clone(), position.shares as f64 * price / total))
            })
            .collect()
    }

    /// Non-blocking limit checks against the configured [`PortfolioLimits`].
    pub fn validate_portfolio_constraints(
        &self,
        prices: &HashMap<String, f64>,
    ) -> Vec<ConstraintWarning> {
        let mut warnings = Vec::new();
        if self.positions.len() > self.limits.max_positions {
            warnings.push(ConstraintWarning::TooManyPositions {
                count: self.positions.len(),
                limit: self.limits.max_positions,
            });
        }

        for (symbol, weight) in self.current_weights(prices) {
            if weight > self.limits.max_position_size + WEIGHT_TOLERANCE {
                warnings.push(ConstraintWarning::PositionTooLarge {
                    symbol,
                    weight,
                    limit: self.limits.max_position_size,
                });
            } else if self.limits.min_position_size > 0.0
                && weight < self.limits.min_position_size - WEIGHT_TOLERANCE
            {
                warnings.push(ConstraintWarning::PositionTooSmall {
                    symbol,
                    weight,
                    limit: self.limits.min_position_size,
                });
            }
        }
        warnings
    }

    pub fn mark_to_market(&mut self, prices: &HashMap<String, f64>) {
        let total = self.get_total_value(prices);
        for position in self.positions.values_mut() {
            if let Some(price) = prices.get(&position.symbol) {
                position.mark(*price, total);
            }
        }
    }

    pub fn record_snapshot(
        &mut self,
        date: NaiveDate,
        prices: &HashMap<String, f64>,
    ) -> &PortfolioSnapshot {
        self.mark_to_market(prices);
        let positions: Vec<Position> = self.positions.values().cloned().collect();
        self.snapshots.push(PortfolioSnapshot {
            date,
            total_value: self.get_total_value(prices),
            cash: self.cash,
            position_count: positions.len(),
            positions,
        });
        &self.snapshots[self.snapshots.len() - 1]
    }

    pub fn summary(&self) -> PortfolioSummary {
        let buy_trades = self
            .trades
            .iter()
            .filter(|trade| trade.action == TradeAction::Buy)
            .count();
        PortfolioSummary {
            cash: self.cash,
            open_positions: self.positions.len(),
            total_trades: self.trades.len(),
            buy_trades,
            sell_trades: self.trades.len() - buy_trades,
            total_commission: self.total_commission,
            realized_pnl: self.realized_pnl,
        }
    }

    pub fn into_history(self) -> (Vec<PortfolioSnapshot>, Vec<Trade>) {
        (self.snapshots, self.trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    fn prices(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn buy_charges_commission_on_notional() {
        let mut portfolio = Portfolio::new(10_000_000.0, 0.00015);
        assert!(portfolio.buy(day(1), "005930", 100, 70_000.0, "test"));
        assert!((10_000_000.0 - portfolio.cash() - 7_001_050.0).abs() < 1e-6);
        let position = portfolio.position("005930").unwrap();
        assert_eq!(position.shares, 100);
        assert!((position.avg_cost - 70_000.0).abs() < 1e-9);
        assert!((portfolio.trades()[0].commission - 1_050.0).abs() < 1e-9);
    }

    #[test]
    fn buy_resizes_to_affordable_quantity() {
        let mut portfolio = Portfolio::new(1_000.0, 0.01);
        assert!(portfolio.buy(day(1), "AAA", 50, 100.0, "test"));
        assert_eq!(portfolio.shares_of("AAA"), 9);
        assert!(portfolio.cash() >= 0.0);

        assert!(!portfolio.buy(day(1), "BBB", 1, 500.0, "test"));
        assert!(portfolio.position("BBB").is_none());
        assert!(!portfolio.buy(day(1), "CCC", 0, 10.0, "test"));
        assert!(!portfolio.buy(day(1), "CCC", 1, f64::NAN, "test"));
    }

    #[test]
    fn average_cost_blends_lots_and_ignores_sells() {
        let mut portfolio = Portfolio::new(100_000.0, 0.0);
        portfolio.buy(day(1), "AAA", 10, 100.0, "test");
        portfolio.buy(day(2), "AAA", 30, 120.0, "test");
        assert!((portfolio.position("AAA").unwrap().avg_cost - 115.0).abs() < 1e-9);
        portfolio.sell(day(3), "AAA", 5, 200.0, "test");
        assert!((portfolio.position("AAA").unwrap().avg_cost - 115.0).abs() < 1e-9);
        assert!((portfolio.summary().realized_pnl - 425.0).abs() < 1e-9);
    }

    #[test]
    fn sell_clamps_and_removes_closed_positions() {
        let mut portfolio = Portfolio::new(10_000.0, 0.001);
        portfolio.buy(day(1), "AAA", 10, 100.0, "test");
        let cash_before = portfolio.cash();
        assert!(portfolio.sell(day(2), "AAA", 25, 110.0, "test"));
        assert!(portfolio.position("AAA").is_none());
        assert_eq!(portfolio.trades()[1].shares, 10);
        assert!((portfolio.cash() - cash_before - 1_100.0 * 0.999).abs() < 1e-9);

        assert!(!portfolio.sell(day(3), "AAA", 1, 110.0, "test"));
        assert!(!portfolio.sell(day(3), "ZZZ", 1, 110.0, "test"));
    }

    #[test]
    fn rebalance_sells_before_buying() {
        let mut portfolio = Portfolio::new(1_000.0, 0.0);
        portfolio.buy(day(1), "AAA", 10, 100.0, "seed");
        assert_eq!(portfolio.cash(), 0.0);

        let quotes = prices(&[("AAA", 100.0), ("BBB", 50.0)]);
        let mut targets = BTreeMap::new();
        targets.insert("BBB".to_string(), 20);
        let executed = portfolio.rebalance_to_target(day(2), &targets, &quotes);
        assert_eq!(executed, 2);
        assert_eq!(portfolio.trades()[1].action, TradeAction::Sell);
        assert_eq!(portfolio.trades()[2].action, TradeAction::Buy);
        assert_eq!(portfolio.shares_of("BBB"), 20);
        assert_eq!(portfolio.shares_of("AAA"), 0);
    }

    #[test]
    fn rebalance_is_idempotent() {
        let mut portfolio = Portfolio::new(50_000.0, 0.0005);
        let quotes = prices(&[("AAA", 101.0), ("BBB", 37.5)]);
        let mut targets = BTreeMap::new();
        targets.insert("AAA".to_string(), 120);
        targets.insert("BBB".to_string(), 300);
        assert_eq!(portfolio.rebalance_to_target(day(1), &targets, &quotes), 2);
        assert_eq!(portfolio.rebalance_to_target(day(1), &targets, &quotes), 0);
    }

    #[test]
    fn missing_price_contributes_nothing_to_value() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        portfolio.buy(day(1), "AAA", 10, 100.0, "test");
        portfolio.buy(day(1), "BBB", 10, 200.0, "test");
        let total = portfolio.get_total_value(&prices(&[("AAA", 110.0)]));
        assert!((total - (7_000.0 + 1_100.0)).abs() < 1e-9);
    }

    #[test]
    fn constraint_violations_are_reported_not_enforced() {
        let limits = PortfolioLimits {
            max_positions: 1,
            max_position_size: 0.3,
            min_position_size: 0.05,
        };
        let mut portfolio = Portfolio::new(10_000.0, 0.0).with_limits(limits);
        portfolio.buy(day(1), "AAA", 50, 100.0, "test");
        portfolio.buy(day(1), "BBB", 1, 100.0, "test");
        let warnings = portfolio.validate_portfolio_constraints(&prices(&[("AAA", 100.0), ("BBB", 100.0)]));
        assert_eq!(warnings.len(), 3);
        assert!(matches!(warnings[0], ConstraintWarning::TooManyPositions { count: 2, limit: 1 }));
        assert!(matches!(warnings[1], ConstraintWarning::PositionTooLarge { .. }));
        assert!(matches!(warnings[2], ConstraintWarning::PositionTooSmall { .. }));
        assert_eq!(portfolio.positions().len(), 2);
    }

    #[test]
    fn snapshot_value_equals_cash_plus_holdings() {
        let mut portfolio = Portfolio::new(10_000.0, 0.001);
        portfolio.buy(day(1), "AAA", 12, 150.0, "test");
        let quotes = prices(&[("AAA", 160.0)]);
        let snapshot = portfolio.record_snapshot(day(2), &quotes).clone();
        assert!((snapshot.total_value - (snapshot.cash + 12.0 * 160.0)).abs() < 1e-9);
        assert_eq!(snapshot.position_count, 1);
        assert!((snapshot.positions[0].unrealized_pnl - 120.0).abs() < 1e-9);
    }
}
