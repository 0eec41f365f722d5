//! Partial execution: keep the affordable head of an unaffordable template.

use std::collections::BTreeSet;

use crate::config::PartialExecutionParams;
use crate::domain::{ActionCandidate, HolisticPlan, OpportunityCategory, OpportunityContext};

/// Up to `max_depth` candidates from `ordered`, one per symbol, with no cash check.
fn template<'a>(ordered: impl IntoIterator<Item = &'a ActionCandidate>, max_depth: usize) -> Vec<ActionCandidate> {
    let mut symbols = BTreeSet::new();
    ordered
        .into_iter()
        .filter(|c| symbols.insert(c.symbol().to_string()))
        .take(max_depth)
        .cloned()
        .collect()
}

/// Build raw templates (overall priority order, buys only, and one per
/// category) and keep the affordable prefix of each one that cannot be paid
/// for in full.
pub fn affordable_prefixes(
    pool: &[ActionCandidate],
    ctx: &OpportunityContext,
    max_depth: usize,
    params: &PartialExecutionParams,
) -> Vec<HolisticPlan> {
    let mut templates = vec![
        template(pool, max_depth),
        template(pool.iter().filter(|c| c.side().is_buy()), max_depth),
    ];
    for category in OpportunityCategory::ALL {
        templates.push(template(pool.iter().filter(|c| c.category == category), max_depth));
    }

    let min_steps = params.min_steps.max(1);
    let mut plans = Vec::new();
    for tpl in templates {
        let full = HolisticPlan::from_candidates(&tpl, "partial_execution");
        let keep = full.affordable_prefix(ctx.available_cash_eur, &ctx.cost_model);
        if keep == tpl.len() || keep < min_steps {
            continue;
        }
        let mut plan = HolisticPlan::from_candidates(&tpl[..keep], "partial_execution");
        plan.partial = true;
        plans.push(plan);
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_support::{ctx, pool};

    #[test]
    fn keeps_affordable_head() {
        // overall template: AAPL sell, NVDA buy, MSFT sell, AMZN buy, META buy
        // with 0 cash: +1000, -800, +1000, -800, then META (800) exceeds 400
        let plans = affordable_prefixes(&pool(), &ctx(0.0), 5, &PartialExecutionParams::default());
        assert!(plans.iter().all(|p| p.partial));
        assert!(plans.iter().any(|p| p.len() == 4));
        for plan in &plans {
            assert_eq!(plan.affordable_prefix(0.0, &ctx(0.0).cost_model), plan.len());
        }
    }

    #[test]
    fn fully_affordable_templates_are_skipped() {
        let plans = affordable_prefixes(&pool(), &ctx(100_000.0), 5, &PartialExecutionParams::default());
        assert!(plans.is_empty());
    }

    #[test]
    fn min_steps_discards_short_heads() {
        let params = PartialExecutionParams { min_steps: 5 };
        let plans = affordable_prefixes(&pool(), &ctx(0.0), 5, &params);
        assert!(plans.is_empty());
    }
}
