//! Buy highly scored securities.

use crate::config::OpportunityBuysParams;
use crate::domain::{ActionCandidate, OpportunityCategory, OpportunityContext, TradeSide};

use super::{finish, lot_size, price_of, quantity_for_value, CalculatorError, OpportunityCalculator, Proposal};

/// BUY up to `max_value_per_position` of any security scored at least `min_score`.
#[derive(Debug, Clone)]
pub struct OpportunityBuys {
    params: OpportunityBuysParams,
}

impl OpportunityBuys {
    pub fn new(params: OpportunityBuysParams) -> Self {
        Self { params }
    }
}

impl OpportunityCalculator for OpportunityBuys {
    fn name(&self) -> &'static str {
        "opportunity_buys"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        symbol: &str,
    ) -> Result<Option<ActionCandidate>, CalculatorError> {
        let Some(score) = ctx.security(symbol).and_then(|s| s.score) else {
            return Ok(None);
        };
        if !score.is_finite() {
            return Err(CalculatorError::NonFinite {
                symbol: symbol.to_string(),
                field: "score",
            });
        }
        if score < self.params.min_score {
            return Ok(None);
        }
        if self.params.exclude_existing && ctx.held_quantity(symbol) > 0 {
            return Ok(None);
        }
        let Some(price) = price_of(ctx, symbol)? else {
            return Ok(None);
        };

        let quantity = quantity_for_value(self.params.max_value_per_position, price, lot_size(ctx, symbol));

        Ok(finish(
            ctx,
            Proposal {
                symbol,
                side: TradeSide::Buy,
                quantity,
                price,
                priority: score,
                category: OpportunityCategory::OpportunityBuys,
                reason: format!("opportunity score {score:.2}"),
                tag: "high_score",
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
    fn buys_scored_security() {
        let calc = OpportunityBuys::new(OpportunityBuysParams::default());
        let c = calc.calculate(&sample_ctx(), "NVDA").unwrap().unwrap();
        assert_eq!(c.step.quantity, 20);
        assert!((c.priority - 0.9).abs() < 1e-10);
    }

    #[test]
    fn unscored_or_low_scored_is_ignored() {
        let calc = OpportunityBuys::new(OpportunityBuysParams::default());
        assert!(calc.calculate(&sample_ctx(), "AAPL").unwrap().is_none());

        let strict = OpportunityBuys::new(OpportunityBuysParams {
            min_score: 0.95,
            ..Default::default()
        });
        assert!(strict.calculate(&sample_ctx(), "NVDA").unwrap().is_none());
    }

    #[test]
    fn exclude_existing_skips_holdings() {
        let mut ctx = sample_ctx();
        ctx.securities[0].score = Some(0.8);
        let calc = OpportunityBuys::new(OpportunityBuysParams {
            exclude_existing: true,
            ..Default::default()
        });
        assert!(calc.calculate(&ctx, "AAPL").unwrap().is_none());
    }

    #[test]
    fn global_buy_ban_blocks() {
        let mut ctx = sample_ctx();
        ctx.allow_buy = false;
        let calc = OpportunityBuys::new(OpportunityBuysParams::default());
        assert!(calc.calculate(&ctx, "NVDA").unwrap().is_none());
    }
}
