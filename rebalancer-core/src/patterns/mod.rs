//! Plan-shape patterns: turn the candidate pool into whole plan templates.
//!
//! Every pattern walks the pool in its own order and fills a plan greedily:
//! one step per symbol, BUY steps only while cash (plus earlier sell proceeds)
//! covers them, and never more steps than the depth limit.

pub mod adaptive;
pub mod special;

use std::collections::BTreeSet;

use crate::config::PatternConfig;
use crate::domain::{ActionCandidate, HolisticPlan, OpportunityCategory, OpportunityContext, TradeSide};

pub use adaptive::{Adaptive, MarketRegimePattern};
pub use special::{CashGeneration, CostOptimized, SingleBest};

// ─── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern {pattern}: non-finite {field}")]
    NonFinite {
        pattern: &'static str,
        field: &'static str,
    },
}

// ─── Trait ───────────────────────────────────────────────────────────

/// Builds plan templates from a priority-ordered candidate pool.
pub trait PlanPattern: Send + Sync {
    fn name(&self) -> &'static str;

    /// `pool` is sorted by priority, highest first.
    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError>;
}

/// Build the runtime pattern for a configuration entry.
pub fn create_pattern(config: &PatternConfig) -> Box<dyn PlanPattern> {
    use OpportunityCategory::*;
    use Stage::*;

    let name = config.name();
    match config {
        PatternConfig::DirectBuy(p) => Box::new(TemplatePattern::new(name, vec![Side(TradeSide::Buy)], p.max_steps)),
        PatternConfig::ProfitTaking(p) => Box::new(TemplatePattern::new(
            name,
            vec![Category(ProfitTaking), Side(TradeSide::Buy)],
            p.max_steps,
        )),
        PatternConfig::Rebalance(p) => Box::new(TemplatePattern::new(
            name,
            vec![Category(RebalanceSells), Category(RebalanceBuys)],
            p.max_steps.or(Some(4)),
        )),
        PatternConfig::AveragingDown(p) => {
            Box::new(TemplatePattern::new(name, vec![Category(AveragingDown)], p.max_steps))
        }
        PatternConfig::SingleBest(_) => Box::new(SingleBest),
        PatternConfig::MultiSell(p) => Box::new(TemplatePattern::new(
            name,
            vec![Side(TradeSide::Sell)],
            p.max_steps.or(Some(3)),
        )),
        PatternConfig::MixedStrategy(p) => Box::new(TemplatePattern::new(
            name,
            vec![Interleave],
            p.max_steps,
        )),
        PatternConfig::OpportunityFirst(p) => Box::new(TemplatePattern::new(
            name,
            vec![Category(OpportunityBuys), Side(TradeSide::Sell), Side(TradeSide::Buy)],
            p.max_steps,
        )),
        PatternConfig::DeepRebalance(p) => Box::new(TemplatePattern::new(
            name,
            vec![
                Category(RebalanceSells),
                Category(ProfitTaking),
                Category(RebalanceBuys),
                Category(AveragingDown),
            ],
            p.max_steps,
        )),
        PatternConfig::CashGeneration(p) => Box::new(CashGeneration::new(p.clone())),
        PatternConfig::CostOptimized(p) => Box::new(CostOptimized::new(p.max_steps)),
        PatternConfig::Adaptive(p) => Box::new(Adaptive::new(p.max_steps)),
        PatternConfig::MarketRegime(p) => Box::new(MarketRegimePattern::new(p.regime, p.max_steps)),
    }
}

// ─── Greedy fill ─────────────────────────────────────────────────────

/// Effective step limit: the pattern's own cap, never above `max_depth`.
pub(crate) fn step_limit(max_steps: Option<usize>, max_depth: usize) -> usize {
    max_steps.map_or(max_depth, |m| m.min(max_depth))
}

/// Walk `ordered` and keep every candidate that fits.
///
/// Skips symbols already in the plan and BUY steps the running cash balance
/// cannot cover. Returns `None` when nothing fits.
pub(crate) fn fill<'a>(
    ordered: impl IntoIterator<Item = &'a ActionCandidate>,
    ctx: &OpportunityContext,
    limit: usize,
    origin: &str,
) -> Option<HolisticPlan> {
    if limit == 0 {
        return None;
    }
    let costs = &ctx.cost_model;
    let mut cash = ctx.available_cash_eur.max(0.0);
    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut picked: Vec<ActionCandidate> = Vec::new();

    for candidate in ordered {
        if picked.len() >= limit {
            break;
        }
        if used.contains(candidate.symbol()) {
            continue;
        }
        match candidate.side() {
            TradeSide::Buy => {
                let total = costs.buy_total(candidate.value());
                if total > cash {
                    continue;
                }
                cash -= total;
            }
            TradeSide::Sell => cash += costs.sell_proceeds(candidate.value()),
        }
        used.insert(candidate.symbol());
        picked.push(candidate.clone());
    }

    if picked.is_empty() {
        None
    } else {
        Some(HolisticPlan::from_candidates(&picked, origin))
    }
}

pub(crate) fn check_cash(ctx: &OpportunityContext, pattern: &'static str) -> Result<(), PatternError> {
    if !ctx.available_cash_eur.is_finite() {
        return Err(PatternError::NonFinite {
            pattern,
            field: "available_cash_eur",
        });
    }
    Ok(())
}

// ─── Template patterns ───────────────────────────────────────────────

/// One slice of the pool, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Category(OpportunityCategory),
    Side(TradeSide),
    /// Alternate sells and buys, starting with a sell.
    Interleave,
}

impl Stage {
    fn select<'a>(&self, pool: &'a [ActionCandidate]) -> Vec<&'a ActionCandidate> {
        match *self {
            Stage::Category(cat) => pool.iter().filter(|c| c.category == cat).collect(),
            Stage::Side(side) => pool.iter().filter(|c| c.side() == side).collect(),
            Stage::Interleave => {
                let sells: Vec<_> = pool.iter().filter(|c| c.side().is_sell()).collect();
                let buys: Vec<_> = pool.iter().filter(|c| c.side().is_buy()).collect();
                let mut out = Vec::with_capacity(pool.len());
                for i in 0..sells.len().max(buys.len()) {
                    out.extend(sells.get(i).copied());
                    out.extend(buys.get(i).copied());
                }
                out
            }
        }
    }
}

/// A pattern defined by an ordered list of stages.
#[derive(Debug, Clone)]
pub struct TemplatePattern {
    name: &'static str,
    stages: Vec<Stage>,
    max_steps: Option<usize>,
}

impl TemplatePattern {
    pub fn new(name: &'static str, stages: Vec<Stage>, max_steps: Option<usize>) -> Self {
        Self {
            name,
            stages,
            max_steps,
        }
    }
}

impl PlanPattern for TemplatePattern {
    fn name(&self) -> &'static str {
        self.name
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        check_cash(ctx, self.name)?;
        let ordered: Vec<&ActionCandidate> = self.stages.iter().flat_map(|s| s.select(pool)).collect();
        let limit = step_limit(self.max_steps, max_depth);
        Ok(fill(ordered, ctx, limit, self.name).into_iter().collect())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::cost_model::CostModel;
    use crate::domain::{ActionCandidate, HolisticStep, OpportunityCategory, OpportunityContext, TradeSide};

    pub fn candidate(
        symbol: &str,
        side: TradeSide,
        qty: u64,
        price: f64,
        priority: f64,
        category: OpportunityCategory,
    ) -> ActionCandidate {
        ActionCandidate {
            step: HolisticStep::new(symbol, side, qty, price, "EUR", "test"),
            priority,
            category,
            tags: vec![],
        }
    }

    /// Pool sorted by priority: two sells worth 1000 each, three buys worth 800 each.
    pub fn pool() -> Vec<ActionCandidate> {
        use OpportunityCategory::*;
        vec![
            candidate("AAPL", TradeSide::Sell, 10, 100.0, 0.9, ProfitTaking),
            candidate("NVDA", TradeSide::Buy, 8, 100.0, 0.85, OpportunityBuys),
            candidate("MSFT", TradeSide::Sell, 10, 100.0, 0.7, RebalanceSells),
            candidate("AMZN", TradeSide::Buy, 8, 100.0, 0.6, RebalanceBuys),
            candidate("META", TradeSide::Buy, 8, 100.0, 0.5, AveragingDown),
        ]
    }

    pub fn ctx(cash: f64) -> OpportunityContext {
        OpportunityContext {
            available_cash_eur: cash,
            cost_model: CostModel::frictionless(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ctx, pool};
    use super::*;
    use crate::config::PatternParams;

    fn symbols(plan: &HolisticPlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.symbol.as_str()).collect()
    }

    #[test]
    fn direct_buy_respects_cash() {
        let p = create_pattern(&PatternConfig::DirectBuy(PatternParams::default()));
        let plans = p.generate(&pool(), &ctx(1000.0), 5).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(symbols(&plans[0]), vec!["NVDA"]);
    }

    #[test]
    fn sell_proceeds_fund_buys() {
        let p = create_pattern(&PatternConfig::ProfitTaking(PatternParams::default()));
        let plans = p.generate(&pool(), &ctx(0.0), 5).unwrap();
        // AAPL sell frees 1000, enough for one 800 buy
        assert_eq!(symbols(&plans[0]), vec!["AAPL", "NVDA"]);
    }

    #[test]
    fn depth_limit_caps_steps() {
        let p = create_pattern(&PatternConfig::DeepRebalance(PatternParams::default()));
        let plans = p.generate(&pool(), &ctx(10_000.0), 2).unwrap();
        assert_eq!(plans[0].len(), 2);
        assert_eq!(symbols(&plans[0]), vec!["MSFT", "AAPL"]);
    }

    #[test]
    fn mixed_strategy_interleaves() {
        let p = create_pattern(&PatternConfig::MixedStrategy(PatternParams::default()));
        let plans = p.generate(&pool(), &ctx(0.0), 5).unwrap();
        assert_eq!(symbols(&plans[0]), vec!["AAPL", "NVDA", "MSFT", "AMZN"]);
    }

    #[test]
    fn empty_pool_yields_nothing() {
        for cfg in PatternConfig::all_defaults() {
            let p = create_pattern(&cfg);
            assert!(p.generate(&[], &ctx(1000.0), 5).unwrap().is_empty(), "{}", p.name());
        }
    }

    #[test]
    fn non_finite_cash_is_an_error() {
        let p = create_pattern(&PatternConfig::DirectBuy(PatternParams::default()));
        assert!(p.generate(&pool(), &ctx(f64::NAN), 5).is_err());
    }

    #[test]
    fn every_pattern_stays_within_depth() {
        for cfg in PatternConfig::all_defaults() {
            let p = create_pattern(&cfg);
            for plan in p.generate(&pool(), &ctx(2000.0), 3).unwrap() {
                assert!(plan.len() <= 3, "{} produced {} steps", p.name(), plan.len());
                assert_eq!(plan.origin, p.name());
            }
        }
    }
}
