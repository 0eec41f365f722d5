//! Add to positions sitting at a moderate loss.

use crate::config::AveragingDownParams;
use crate::domain::{ActionCandidate, OpportunityCategory, OpportunityContext, TradeSide};

use super::{
    finish, lot_size, position_return, price_of, quantity_for_value, round_to_lot, CalculatorError,
    OpportunityCalculator, Proposal,
};

/// BUY `fraction` of a held position when its loss lies in `[max_loss, min_loss]`.
///
/// Deeper losses inside the band rank higher (`loss / max_loss`).
#[derive(Debug, Clone)]
pub struct AveragingDown {
    params: AveragingDownParams,
}

impl AveragingDown {
    pub fn new(params: AveragingDownParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for AveragingDown {
    fn name(&self) -> &'static str {
        "averaging_down"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };
        let Some(ret) = position_return(ctx, symbol, price)? else {
            return Ok(None);
        };
        if ret < self.params.max_loss || ret > self.params.min_loss {
            return Ok(None);
        }

        let lot = lot_size(ctx, symbol);
        let wanted = round_to_lot(ctx.held_quantity(symbol) as f64 * self.params.fraction, lot).max(lot);
        let cap = quantity_for_value(self.params.max_value_per_position, price, lot);
        let quantity = wanted.min(cap);

        let priority = if self.params.max_loss < 0.0 {
            ret / self.params.max_loss
        } else {
            0.0
        };

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side: TradeSide::Buy,
                quantity,
                price,
                priority,
                category: OpportunityCategory::AveragingDown,
                reason: format!("averaging down at {:.1}%", ret * 100.0),
                tag: "averaging_down",
                max_cost_ratio: self.params.max_cost_ratio,
            },
        ))
    }
}
