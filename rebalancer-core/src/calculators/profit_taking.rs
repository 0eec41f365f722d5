//! Trim positions that have run far above their cost basis.

use crate::config::ProfitTakingParams;
use crate::domain::{ActionCandidate, OpportunityCategory, OpportunityContext, TradeSide};

use super::{finish, lot_size, position_return, price_of, round_to_lot, CalculatorError, OpportunityCalculator, Proposal};

/// SELL `sell_fraction` of a position once its gain reaches `windfall_threshold`.
#[derive(Debug, Clone)]
pub struct ProfitTaking {
    params: ProfitTakingParams,
}

impl ProfitTaking {
    pub fn new(params: ProfitTakingParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for ProfitTaking {
    fn name(&self) -> &'static str {
        "profit_taking"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };
        let Some(gain) = position_return(ctx, symbol, price)? else {
            return Ok(None);
        };
        if gain < self.params.windfall_threshold {
            return Ok(None);
        }

        let held = ctx.held_quantity(symbol);
        let lot = lot_size(ctx, symbol);
        let mut quantity = round_to_lot(held as f64 * self.params.sell_fraction, lot);
        if quantity == 0 && held >= lot {
            quantity = lot;
        }

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side: TradeSide::Sell,
                quantity,
                price,
                priority: (gain * self.params.priority_weight).min(1.0),
                category: OpportunityCategory::ProfitTaking,
                reason: format!("windfall gain of {:.1}%", gain * 100.0),
                tag: "windfall",
                max_cost_ratio: self.params.max_cost_ratio,
            },
        ))
    }
}
