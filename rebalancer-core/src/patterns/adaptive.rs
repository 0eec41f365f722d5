//! Patterns that pick their stage list from the portfolio or market state.

use crate::config::MarketRegime;
use crate::domain::{ActionCandidate, HolisticPlan, OpportunityCategory, OpportunityContext, TradeSide};

use super::{PatternError, PlanPattern, Stage, TemplatePattern};

/// Cash above this fraction of portfolio value counts as "idle cash".
const IDLE_CASH_RATIO: f64 = 0.10;

/// Rebalance first when anything is overweight, deploy cash when it is idle,
/// otherwise interleave sells and buys.
#[derive(Debug, Clone)]
pub struct Adaptive {
    max_steps: Option<usize>,
}

impl Adaptive {
    pub fn new(max_steps: Option<usize>) -> Self {
        Self { max_steps }
    }

    fn stages(pool: &[ActionCandidate], ctx: &OpportunityContext) -> Vec<Stage> {
        use OpportunityCategory::*;

        let overweight = pool.iter().any(|c| c.category == RebalanceSells);
        let total = ctx.total_value();
        let cash_ratio = if total > 0.0 {
            ctx.available_cash_eur / total
        } else {
            0.0
        };

        if overweight {
            vec![
                Stage::Category(RebalanceSells),
                Stage::Category(RebalanceBuys),
                Stage::Side(TradeSide::Buy),
            ]
        } else if cash_ratio > IDLE_CASH_RATIO {
            vec![Stage::Category(OpportunityBuys), Stage::Side(TradeSide::Buy)]
        } else {
            vec![Stage::Interleave]
        }
    }
}

impl PlanPattern for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        TemplatePattern::new(self.name(), Self::stages(pool, ctx), self.max_steps).generate(pool, ctx, max_depth)
    }
}

/// Stage list chosen by the configured market regime.
#[derive(Debug, Clone)]
pub struct MarketRegimePattern {
    regime: MarketRegime,
    max_steps: Option<usize>,
}

impl MarketRegimePattern {
    pub fn new(regime: MarketRegime, max_steps: Option<usize>) -> Self {
        Self { regime, max_steps }
    }

    fn stages(&self) -> Vec<Stage> {
        use OpportunityCategory::*;
        match self.regime {
            MarketRegime::Bull => vec![
                Stage::Category(OpportunityBuys),
                Stage::Category(AveragingDown),
                Stage::Side(TradeSide::Buy),
            ],
            MarketRegime::Bear => vec![
                Stage::Category(ProfitTaking),
                Stage::Category(RebalanceSells),
                Stage::Side(TradeSide::Sell),
            ],
            MarketRegime::Sideways => vec![Stage::Category(RebalanceSells), Stage::Category(RebalanceBuys)],
        }
    }
}

impl PlanPattern for MarketRegimePattern {
    fn name(&self) -> &'static str {
        "market_regime"
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        TemplatePattern::new(self.name(), self.stages(), self.max_steps).generate(pool, ctx, max_depth)
    }
}
