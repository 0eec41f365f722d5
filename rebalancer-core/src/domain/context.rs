//! Market + portfolio snapshots used for candidate discovery and simulation.
//!
//! `OpportunityContext` is built once per request and is read-only during
//! planning. `EvaluationContext` borrows it and optionally carries price
//! adjustments for a stochastic or Monte-Carlo scenario.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::PortfolioHash;
use super::step::TradeSide;
use crate::cost_model::CostModel;
use crate::fingerprint::portfolio_hash;

fn default_true() -> bool {
    true
}

fn default_lot() -> u64 {
    1
}

fn default_currency() -> String {
    "EUR".into()
}

/// A held position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
    pub average_cost: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

/// Tradable security metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_true")]
    pub allow_buy: bool,
    #[serde(default = "default_true")]
    pub allow_sell: bool,
    #[serde(default = "default_lot")]
    pub min_lot: u64,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    /// Opportunity score in [0, 1], when the scoring service has one.
    #[serde(default)]
    pub score: Option<f64>,
    /// Annualized volatility, when known.
    #[serde(default)]
    pub volatility: Option<f64>,
}

impl Security {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: String::new(),
            currency: default_currency(),
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
            country: None,
            industry: None,
            score: None,
            volatility: None,
        }
    }
}

/// An order already submitted to the broker but not yet filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: u64,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

/// Symbol sets that restrict what a single planning call may propose.
///
/// Built explicitly by the caller for each call; never mutated by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exclusions {
    /// Never traded in this call (any side).
    pub ineligible: BTreeSet<String>,
    /// Sold recently: not bought back in this call.
    pub recently_sold: BTreeSet<String>,
    /// Bought recently: not sold in this call.
    pub recently_bought: BTreeSet<String>,
}

impl Exclusions {
    pub fn with_ineligible(mut self, symbol: impl Into<String>) -> Self {
        self.ineligible.insert(symbol.into());
        self
    }

    pub fn with_recently_sold(mut self, symbol: impl Into<String>) -> Self {
        self.recently_sold.insert(symbol.into());
        self
    }

    pub fn with_recently_bought(mut self, symbol: impl Into<String>) -> Self {
        self.recently_bought.insert(symbol.into());
        self
    }

    /// Whether a trade on `symbol` in direction `side` is allowed by these sets.
    pub fn permits(&self, symbol: &str, side: TradeSide) -> bool {
        if self.ineligible.contains(symbol) {
            return false;
        }
        match side {
            TradeSide::Buy => !self.recently_sold.contains(symbol),
            TradeSide::Sell => !self.recently_bought.contains(symbol),
        }
    }
}

/// Market + portfolio snapshot for candidate discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityContext {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub securities: Vec<Security>,
    /// Cash per currency. Used for fingerprinting.
    #[serde(default)]
    pub cash_balances: BTreeMap<String, f64>,
    /// Cash available for buys, already converted to EUR.
    pub available_cash_eur: f64,
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
    /// Target portfolio weights per symbol (fractions of total value).
    #[serde(default)]
    pub target_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub pending_orders: Vec<PendingOrder>,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default)]
    pub cost_model: CostModel,
    #[serde(default = "default_true")]
    pub allow_buy: bool,
    #[serde(default = "default_true")]
    pub allow_sell: bool,
}

impl Default for OpportunityContext {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            securities: Vec::new(),
            cash_balances: BTreeMap::new(),
            available_cash_eur: 0.0,
            prices: BTreeMap::new(),
            target_weights: BTreeMap::new(),
            pending_orders: Vec::new(),
            exclusions: Exclusions::default(),
            cost_model: CostModel::default(),
            allow_buy: true,
            allow_sell: true,
        }
    }
}

impl OpportunityContext {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn security(&self, symbol: &str) -> Option<&Security> {
        self.securities.iter().find(|s| s.symbol == symbol)
    }

    /// Current price, only if finite and strictly positive.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices
            .get(symbol)
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)
    }

    pub fn held_quantity(&self, symbol: &str) -> u64 {
        self.position(symbol).map_or(0, |p| p.quantity)
    }

    /// Market value of one position at current prices (0 without a price).
    pub fn position_value(&self, symbol: &str) -> f64 {
        match self.price(symbol) {
            Some(price) => self.held_quantity(symbol) as f64 * price,
            None => 0.0,
        }
    }

    /// Cash + market value of all priced positions.
    pub fn total_value(&self) -> f64 {
        let invested: f64 = self
            .positions
            .iter()
            .map(|p| self.position_value(&p.symbol))
            .sum();
        self.available_cash_eur.max(0.0) + invested
    }

    /// Current weight of a symbol in the total portfolio (0 when the portfolio is empty).
    pub fn current_weight(&self, symbol: &str) -> f64 {
        let total = self.total_value();
        if total <= 0.0 {
            return 0.0;
        }
        self.position_value(symbol) / total
    }

    pub fn target_weight(&self, symbol: &str) -> Option<f64> {
        self.target_weights.get(symbol).copied()
    }

    /// Global + per-security side permission.
    pub fn side_allowed(&self, symbol: &str, side: TradeSide) -> bool {
        let global = match side {
            TradeSide::Buy => self.allow_buy,
            TradeSide::Sell => self.allow_sell,
        };
        let per_security = self.security(symbol).map_or(true, |s| match side {
            TradeSide::Buy => s.allow_buy,
            TradeSide::Sell => s.allow_sell,
        });
        global && per_security
    }

    /// Side permission and exclusion sets combined.
    pub fn can_trade(&self, symbol: &str, side: TradeSide) -> bool {
        self.side_allowed(symbol, side) && self.exclusions.permits(symbol, side)
    }

    /// Smallest trade value whose cost stays within `max_cost_ratio` of the trade.
    pub fn min_trade_amount(&self, max_cost_ratio: f64) -> f64 {
        self.cost_model.min_trade_amount(max_cost_ratio)
    }

    pub fn currency_of(&self, symbol: &str) -> String {
        self.security(symbol)
            .map(|s| s.currency.clone())
            .unwrap_or_else(default_currency)
    }

    pub fn portfolio_hash(&self) -> PortfolioHash {
        portfolio_hash(self)
    }
}

// ─── Evaluation context ─────────────────────────────────────────────

/// Price perturbation applied for one evaluation scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum PriceAdjustments {
    /// Same relative shift on every symbol (`0.05` = +5%).
    Uniform(f64),
    /// Per-symbol price multipliers; symbols without an entry are unchanged.
    PerSymbol(BTreeMap<String, f64>),
}

/// Snapshot view used by the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub snapshot: &'a OpportunityContext,
    pub portfolio_hash: PortfolioHash,
    pub adjustments: Option<PriceAdjustments>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(snapshot: &'a OpportunityContext) -> Self {
        Self {
            snapshot,
            portfolio_hash: snapshot.portfolio_hash(),
            adjustments: None,
        }
    }

    /// Same snapshot, different scenario.
    pub fn with_adjustments(&self, adjustments: PriceAdjustments) -> Self {
        Self {
            snapshot: self.snapshot,
            portfolio_hash: self.portfolio_hash.clone(),
            adjustments: Some(adjustments),
        }
    }

    /// Apply this scenario's adjustment to `base`.
    pub fn adjust(&self, symbol: &str, base: f64) -> f64 {
        match &self.adjustments {
            None => base,
            Some(PriceAdjustments::Uniform(shift)) => base * (1.0 + shift),
            Some(PriceAdjustments::PerSymbol(multipliers)) => {
                base * multipliers.get(symbol).copied().unwrap_or(1.0)
            }
        }
    }

    /// Raw snapshot price with the scenario adjustment applied.
    ///
    /// Returns the unvalidated value so the evaluator can reject non-finite inputs.
    pub fn raw_price(&self, symbol: &str) -> Option<f64> {
        let base = *self.snapshot.prices.get(symbol)?;
        Some(self.adjust(symbol, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> OpportunityContext {
        OpportunityContext {
            positions: vec![Position {
                symbol: "AAPL".into(),
                quantity: 10,
                average_cost: 80.0,
                currency: "EUR".into(),
            }],
            securities: vec![Security::new("AAPL"), Security::new("MSFT")],
            available_cash_eur: 1000.0,
            prices: [("AAPL".to_string(), 100.0), ("MSFT".to_string(), 0.0)]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn total_value_and_weights() {
        let c = ctx();
        assert!((c.total_value() - 2000.0).abs() < 1e-10);
        assert!((c.current_weight("AAPL") - 0.5).abs() < 1e-10);
        assert_eq!(c.current_weight("MSFT"), 0.0);
    }

    #[test]
    fn zero_price_is_no_price() {
        assert_eq!(ctx().price("MSFT"), None);
    }

    #[test]
    fn exclusions_gate_sides() {
        let mut c = ctx();
        c.exclusions = Exclusions::default()
            .with_recently_sold("MSFT")
            .with_recently_bought("AAPL");
        assert!(!c.can_trade("MSFT", TradeSide::Buy));
        assert!(c.can_trade("MSFT", TradeSide::Sell));
        assert!(!c.can_trade("AAPL", TradeSide::Sell));
        assert!(c.can_trade("AAPL", TradeSide::Buy));
    }

    #[test]
    fn security_permission_overrides_global() {
        let mut c = ctx();
        c.securities[0].allow_sell = false;
        assert!(!c.side_allowed("AAPL", TradeSide::Sell));
        c.allow_buy = false;
        assert!(!c.side_allowed("MSFT", TradeSide::Buy));
    }

    #[test]
    fn uniform_adjustment_shifts_price() {
        let c = ctx();
        let eval = EvaluationContext::new(&c).with_adjustments(PriceAdjustments::Uniform(-0.1));
        assert!((eval.raw_price("AAPL").unwrap() - 90.0).abs() < 1e-10);
        assert_eq!(eval.portfolio_hash, c.portfolio_hash());
    }
}
