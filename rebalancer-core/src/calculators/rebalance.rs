//! Move positions back toward their target weights.

use crate::config::{RebalanceBuysParams, RebalanceSellsParams};
use crate::domain::{ActionCandidate, OpportunityCategory, OpportunityContext, TradeSide};

use super::{finish, lot_size, price_of, quantity_for_value, round_to_lot, CalculatorError, OpportunityCalculator, Proposal};

fn check_target(symbol: &str, target: f64) -> Result<f64, CalculatorError> {
    if !target.is_finite() {
        return Err(CalculatorError::NonFinite {
            symbol: symbol.to_string(),
            field: "target_weight",
        });
    }
    if target < 0.0 {
        return Err(CalculatorError::Invalid {
            symbol: symbol.to_string(),
            reason: format!("negative target weight {target}"),
        });
    }
    Ok(target)
}

// ─── Sells ───────────────────────────────────────────────────────────

/// SELL an overweight position back down to its target.
#[derive(Debug, Clone)]
pub struct RebalanceSells {
    params: RebalanceSellsParams,
}

impl RebalanceSells {
    pub fn new(params: RebalanceSellsParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for RebalanceSells {
    fn name(&self) -> &'static str {
        "rebalance_sells"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(target) = ctx.target_weight(symbol) else {
            return Ok(None);
        };
        let target = check_target(symbol, target)?;
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };
        let held = ctx.held_quantity(symbol);
        if held == 0 {
            return Ok(None);
        }

        let weight = ctx.current_weight(symbol);
        let overweight = weight - target;
        if overweight < self.params.min_overweight {
            return Ok(None);
        }

        let lot = lot_size(ctx, symbol);
        let excess = quantity_for_value(overweight * ctx.total_value(), price, lot);
        let cap = round_to_lot(held as f64 * self.params.max_sell_fraction, lot);
        let quantity = excess.min(cap).min(held);

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side: TradeSide::Sell,
                quantity,
                price,
                priority: (overweight / weight).min(1.0),
                category: OpportunityCategory::RebalanceSells,
                reason: format!(
                    "overweight {:.1}% vs target {:.1}%",
                    weight * 100.0,
                    target * 100.0
                ),
                tag: "overweight",
                max_cost_ratio: self.params.max_cost_ratio,
            },
        ))
    }
}

// ─── Buys ────────────────────────────────────────────────────────────

/// BUY an underweight position up toward its target, capped per trade.
#[derive(Debug, Clone)]
pub struct RebalanceBuys {
    params: RebalanceBuysParams,
}

impl RebalanceBuys {
    pub fn new(params: RebalanceBuysParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for RebalanceBuys {
    fn name(&self) -> &'static str {
        "rebalance_buys"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(target) = ctx.target_weight(symbol) else {
            return Ok(None);
        };
        let target = check_target(symbol, target)?;
        if target <= 0.0 {
            return Ok(None);
        }
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };

        let weight = ctx.current_weight(symbol);
        let underweight = target - weight;
        if underweight < self.params.min_underweight {
            return Ok(None);
        }

        let value = (underweight * ctx.total_value()).min(self.params.max_value_per_position);
        let quantity = quantity_for_value(value, price, lot_size(ctx, symbol));

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side: TradeSide::Buy,
                quantity,
                price,
                priority: (underweight / target).min(1.0),
                category: OpportunityCategory::RebalanceBuys,
                reason: format!(
                    "underweight {:.1}% vs target {:.1}%",
                    weight * 100.0,
                    target * 100.0
                ),
                tag: "underweight",
                max_cost_ratio: self.params.max_cost_ratio,
            },
        ))
    }
}
