//! Patterns with their own selection rule rather than a stage list.

use std::cmp::Ordering;

use crate::config::CashGenerationParams;
use crate::domain::{ActionCandidate, HolisticPlan, OpportunityContext};

use super::{check_cash, fill, step_limit, PatternError, PlanPattern};

/// The single highest-priority affordable action.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleBest;

impl PlanPattern for SingleBest {
    fn name(&self) -> &'static str {
        "single_best"
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        check_cash(ctx, self.name())?;
        Ok(fill(pool, ctx, step_limit(Some(1), max_depth), self.name())
            .into_iter()
            .collect())
    }
}

// ─── Cash generation ─────────────────────────────────────────────────

/// Sell the highest-priority positions until cash reaches a target fraction of
/// portfolio value. Produces nothing when cash is already sufficient.
#[derive(Debug, Clone)]
pub struct CashGeneration {
    params: CashGenerationParams,
}

impl CashGeneration {
    pub fn new(params: CashGenerationParams) -> Self {
        Self { params }
    }
}

impl PlanPattern for CashGeneration {
    fn name(&self) -> &'static str {
        "cash_generation"
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        check_cash(ctx, self.name())?;
        let total = ctx.total_value();
        if !total.is_finite() {
            return Err(PatternError::NonFinite {
                pattern: self.name(),
                field: "total_value",
            });
        }

        let mut shortfall = self.params.target_cash_fraction * total - ctx.available_cash_eur;
        if shortfall <= 0.0 {
            return Ok(Vec::new());
        }

        let limit = step_limit(self.params.max_steps, max_depth);
        let mut picked: Vec<&ActionCandidate> = Vec::new();
        for candidate in pool.iter().filter(|c| c.side().is_sell()) {
            if shortfall <= 0.0 || picked.len() >= limit {
                break;
            }
            if picked.iter().any(|p| p.symbol() == candidate.symbol()) {
                continue;
            }
            shortfall -= ctx.cost_model.sell_proceeds(candidate.value());
            picked.push(candidate);
        }

        Ok(fill(picked, ctx, limit, self.name()).into_iter().collect())
    }
}

// ─── Cost optimized ──────────────────────────────────────────────────

/// Few, large trades: candidates ranked by `priority * (1 - cost / value)`.
#[derive(Debug, Clone)]
pub struct CostOptimized {
    max_steps: usize,
}

impl CostOptimized {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }
}

impl PlanPattern for CostOptimized {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn generate(
        &self,
        pool: &[ActionCandidate],
        ctx: &OpportunityContext,
        max_depth: usize,
    ) -> Result<Vec<HolisticPlan>, PatternError> {
        check_cash(ctx, self.name())?;
        let efficiency = |c: &ActionCandidate| {
            let value = c.value();
            if value <= 0.0 {
                return 0.0;
            }
            c.priority * (1.0 - ctx.cost_model.cost(value) / value)
        };

        let mut ranked: Vec<&ActionCandidate> = pool
            .iter()
            .filter(|c| ctx.cost_model.is_worthwhile(c.value()))
            .collect();
        ranked.sort_by(|a, b| efficiency(b).partial_cmp(&efficiency(a)).unwrap_or(Ordering::Equal));

        let limit = step_limit(Some(self.max_steps), max_depth);
        Ok(fill(ranked, ctx, limit, self.name()).into_iter().collect())
    }
}
