//! Two-sided drift correction against target weights.

use crate::config::WeightBasedParams;
use crate::domain::{ActionCandidate, OpportunityCategory, OpportunityContext, TradeSide};

use super::{finish, lot_size, price_of, quantity_for_value, round_to_lot, CalculatorError, OpportunityCalculator, Proposal};

/// BUY or SELL whenever `|target - weight| >= min_weight_diff`.
///
/// Smaller thresholds than the rebalance calculators and a flat 0.8 priority
/// scale, so this acts as a fine-grained complement to them.
#[derive(Debug, Clone)]
pub struct WeightBased {
    params: WeightBasedParams,
}

impl WeightBased {
    pub fn new(params: WeightBasedParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for WeightBased {
    fn name(&self) -> &'static str {
        "weight_based"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(target) = ctx.target_weight(symbol) else {
            return Ok(None);
        };
        if !target.is_finite() {
            return Err(CalculatorError::NonFinite {
                symbol: symbol.to_string(),
                field: "target_weight",
            });
        }
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };

        let weight = ctx.current_weight(symbol);
        let diff = target - weight;
        if diff.abs() < self.params.min_weight_diff {
            return Ok(None);
        }

        let lot = lot_size(ctx, symbol);
        let value = (diff.abs() * ctx.total_value()).min(self.params.max_value_per_trade);
        let (side, category, quantity) = if diff > 0.0 {
            (
                TradeSide::Buy,
                OpportunityCategory::RebalanceBuys,
                quantity_for_value(value, price, lot),
            )
        } else {
            let held = ctx.held_quantity(symbol);
            let cap = round_to_lot(held as f64 * self.params.max_sell_fraction, lot);
            (
                TradeSide::Sell,
                OpportunityCategory::RebalanceSells,
                quantity_for_value(value, price, lot).min(cap),
            )
        };

        let scale = target.max(weight);
        let priority = if scale > 0.0 {
            0.8 * (diff.abs() / scale).min(1.0)
        } else {
            0.0
        };

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side,
                quantity,
                price,
                priority,
                category,
                reason: format!("weight drift {:+.1}%", diff * 100.0),
                tag: "weight_based",
                max_cost_ratio: self.params.max_cost_ratio,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::sample_ctx;
    use super::*;

    #[test]
    fn buys_below_target() {
        let mut ctx = sample_ctx();
        ctx.target_weights.insert("MSFT".into(), 0.12);
        let calc = WeightBased::new(WeightBasedParams::default());
        let c = calc.calculate(&ctx, "MSFT").unwrap().unwrap();
        assert_eq!(c.side(), TradeSide::Buy);
        assert!(c.priority > 0.0 && c.priority <= 0.8);
    }

    #[test]
    fn sells_above_target() {
        let mut ctx = sample_ctx();
        ctx.target_weights.insert("AAPL".into(), 0.6);
        let calc = WeightBased::new(WeightBasedParams::default());
        let c = calc.calculate(&ctx, "AAPL").unwrap().unwrap();
        assert_eq!(c.side(), TradeSide::Sell);
        assert_eq!(c.category, OpportunityCategory::RebalanceSells);
        // 1000 cap / 150
        assert_eq!(c.step.quantity, 6);
    }

    #[test]
    fn small_drift_is_ignored() {
        let mut ctx = sample_ctx();
        ctx.target_weights.insert("MSFT".into(), 0.08);
        let calc = WeightBased::new(WeightBasedParams::default());
        assert!(calc.calculate(&ctx, "MSFT").unwrap().is_none());
    }
}
