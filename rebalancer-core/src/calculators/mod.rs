//! Opportunity calculators: propose single trade actions per symbol.
//!
//! Calculators inspect one symbol at a time and return at most one candidate.
//! They never see other candidates or plans. A calculator that fails on a
//! symbol returns a [`CalculatorError`]; the generator skips that symbol and
//! keeps going.

pub mod averaging_down;
pub mod opportunity_buys;
pub mod profit_taking;
pub mod rebalance;
pub mod weight_based;

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::CalculatorConfig;
use crate::domain::{ActionCandidate, HolisticStep, OpportunityCategory, OpportunityContext, TradeSide};

pub use averaging_down::AveragingDown;
pub use opportunity_buys::OpportunityBuys;
pub use profit_taking::ProfitTaking;
pub use rebalance::{RebalanceBuys, RebalanceSells};
pub use weight_based::WeightBased;

// ─── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalculatorError {
    #[error("{symbol}: non-finite {field}")]
    NonFinite { symbol: String, field: &'static str },
    #[error("{symbol}: {reason}")]
    Invalid { symbol: String, reason: String },
}

// ─── Trait ───────────────────────────────────────────────────────────

/// Proposes at most one action for a symbol.
pub trait OpportunityCalculator: Send + Sync {
    /// Configuration name (e.g. "profit_taking").
    fn name(&self) -> &'static str;

    /// Inspect `symbol` and return a candidate if the rule fires.
    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError>;
}

/// Build the runtime calculator for a configuration entry.
pub fn create_calculator(config: &CalculatorConfig) -> Box<dyn OpportunityCalculator> {
    match config {
        CalculatorConfig::ProfitTaking(p) => Box::new(ProfitTaking::new(p.clone())),
        CalculatorConfig::AveragingDown(p) => Box::new(AveragingDown::new(p.clone())),
        CalculatorConfig::OpportunityBuys(p) => Box::new(OpportunityBuys::new(p.clone())),
        CalculatorConfig::RebalanceSells(p) => Box::new(RebalanceSells::new(p.clone())),
        CalculatorConfig::RebalanceBuys(p) => Box::new(RebalanceBuys::new(p.clone())),
        CalculatorConfig::WeightBased(p) => Box::new(WeightBased::new(p.clone())),
    }
}

// ─── Shared helpers ──────────────────────────────────────────────────

/// Every symbol the snapshot mentions, sorted.
pub fn universe(ctx: &OpportunityContext) -> Vec<String> {
    let symbols: BTreeSet<&str> = ctx
        .positions
        .iter()
        .map(|p| p.symbol.as_str())
        .chain(ctx.securities.iter().map(|s| s.symbol.as_str()))
        .chain(ctx.target_weights.keys().map(String::as_str))
        .collect();
    symbols.into_iter().map(str::to_string).collect()
}

/// Snapshot price for `symbol`.
///
/// Missing or non-positive prices mean "cannot price" (`Ok(None)`); a NaN or
/// infinite price is corrupt input and an error.
pub(crate) fn price_of(ctx: &OpportunityContext, symbol: &str) -> Result<Option<f64>, CalculatorError> {
    match ctx.prices.get(symbol) {
        None => Ok(None),
        Some(p) if !p.is_finite() => Err(CalculatorError::NonFinite {
            symbol: symbol.to_string(),
            field: "price",
        }),
        Some(p) if *p <= 0.0 => Ok(None),
        Some(p) => Ok(Some(*p)),
    }
}

/// Unrealized return of a held position (`price / average_cost - 1`).
pub(crate) fn position_return(
    ctx: &OpportunityContext,
    symbol: &str,
    price: f64,
) -> Result<Option<f64>, CalculatorError> {
    let Some(position) = ctx.position(symbol) else {
        return Ok(None);
    };
    if position.quantity == 0 {
        return Ok(None);
    }
    if !position.average_cost.is_finite() {
        return Err(CalculatorError::NonFinite {
            symbol: symbol.to_string(),
            field: "average_cost",
        });
    }
    if position.average_cost <= 0.0 {
        return Ok(None);
    }
    Ok(Some(price / position.average_cost - 1.0))
}

pub(crate) fn lot_size(ctx: &OpportunityContext, symbol: &str) -> u64 {
    ctx.security(symbol).map_or(1, |s| s.min_lot.max(1))
}

/// Round a fractional quantity down to whole lots.
pub(crate) fn round_to_lot(quantity: f64, lot: u64) -> u64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0;
    }
    let lot = lot.max(1);
    (quantity / lot as f64).floor() as u64 * lot
}

/// Quantity (in whole lots) purchasable for `value` at `price`.
pub(crate) fn quantity_for_value(value: f64, price: f64, lot: u64) -> u64 {
    if price <= 0.0 {
        return 0;
    }
    round_to_lot(value / price, lot)
}

/// Everything a calculator decided about one candidate.
pub(crate) struct Proposal<'a> {
    pub symbol: &'a str,
    pub side: TradeSide,
    pub quantity: u64,
    pub price: f64,
    pub priority: f64,
    pub category: OpportunityCategory,
    pub reason: String,
    pub tag: &'static str,
    pub max_cost_ratio: f64,
}

/// Apply the rules every calculator shares, then build the candidate.
///
/// Drops the proposal if the quantity is zero or the priority is not finite,
/// if the side is not permitted or the symbol is excluded, and if the trade is
/// too small for its cost.
pub(crate) fn finish(ctx: &OpportunityContext, p: Proposal<'_>) -> Option<ActionCandidate> {
    if p.quantity == 0 || !p.priority.is_finite() {
        return None;
    }
    if !ctx.can_trade(p.symbol, p.side) {
        debug!(symbol = p.symbol, side = %p.side, "candidate blocked by permissions");
        return None;
    }
    let value = p.quantity as f64 * p.price;
    if !ctx.cost_model.is_worthwhile(value) || value < ctx.min_trade_amount(p.max_cost_ratio) {
        debug!(symbol = p.symbol, side = %p.side, value, "candidate too small for its cost");
        return None;
    }
    let step = HolisticStep::new(
        p.symbol,
        p.side,
        p.quantity,
        p.price,
        ctx.currency_of(p.symbol),
        p.reason,
    );
    Some(ActionCandidate {
        step,
        priority: p.priority.clamp(0.0, 1.0),
        category: p.category,
        tags: vec![p.tag.to_string()],
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::cost_model::CostModel;
    use crate::domain::{OpportunityContext, Position, Security};

    /// Two holdings and one watchlist security, frictionless costs.
    pub fn sample_ctx() -> OpportunityContext {
        let mut nvda = Security::new("NVDA");
        nvda.score = Some(0.9);
        OpportunityContext {
            positions: vec![
                Position {
                    symbol: "AAPL".into(),
                    quantity: 100,
                    average_cost: 100.0,
                    currency: "EUR".into(),
                },
                Position {
                    symbol: "MSFT".into(),
                    quantity: 20,
                    average_cost: 100.0,
                    currency: "EUR".into(),
                },
            ],
            securities: vec![Security::new("AAPL"), Security::new("MSFT"), nvda],
            available_cash_eur: 5000.0,
            prices: [("AAPL", 150.0), ("MSFT", 85.0), ("NVDA", 50.0)]
                .into_iter()
                .map(|(s, p)| (s.to_string(), p))
                .collect(),
            cost_model: CostModel::frictionless(),
            ..Default::default()
        }
    }
}
