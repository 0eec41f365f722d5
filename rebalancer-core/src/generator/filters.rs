//! Post-generation sequence filters.
//!
//! A filter rejects whole plans. Filters see the snapshot but never modify
//! plans; they run after every strategy has produced its sequences.

use std::collections::BTreeMap;

use crate::config::{DiversityFilterParams, FilterConfig};
use crate::domain::{HolisticPlan, OpportunityContext, TradeSide};

pub trait SequenceFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` if the plan may be kept.
    fn permits(&self, plan: &HolisticPlan, ctx: &OpportunityContext) -> bool;
}

pub fn create_filter(config: &FilterConfig) -> Box<dyn SequenceFilter> {
    match config {
        FilterConfig::Eligibility(_) => Box::new(EligibilityFilter),
        FilterConfig::RecentlyTraded(_) => Box::new(RecentlyTradedFilter),
        FilterConfig::Diversity(p) => Box::new(DiversityFilter::new(p.clone())),
    }
}

/// Rejects plans touching ineligible symbols or disallowed sides.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityFilter;

impl SequenceFilter for EligibilityFilter {
    fn name(&self) -> &'static str {
        "eligibility"
    }

    fn permits(&self, plan: &HolisticPlan, ctx: &OpportunityContext) -> bool {
        plan.steps.iter().all(|s| {
            !ctx.exclusions.ineligible.contains(&s.symbol) && ctx.side_allowed(&s.symbol, s.side)
        })
    }
}

/// Rejects buy-backs of recent sells and sells of recent buys.
#[derive(Debug, Clone, Copy)]
pub struct RecentlyTradedFilter;

impl SequenceFilter for RecentlyTradedFilter {
    fn name(&self) -> &'static str {
        "recently_traded"
    }

    fn permits(&self, plan: &HolisticPlan, ctx: &OpportunityContext) -> bool {
        plan.steps.iter().all(|s| match s.side {
            TradeSide::Buy => !ctx.exclusions.recently_sold.contains(&s.symbol),
            TradeSide::Sell => !ctx.exclusions.recently_bought.contains(&s.symbol),
        })
    }
}

/// Caps how many BUY steps of one plan land in the same industry or country.
#[derive(Debug, Clone)]
pub struct DiversityFilter {
    params: DiversityFilterParams,
}

impl DiversityFilter {
    pub fn new(params: DiversityFilterParams) -> Self {
        Self { params }
    }
}

impl SequenceFilter for DiversityFilter {
    fn name(&self) -> &'static str {
        "diversity"
    }

    fn permits(&self, plan: &HolisticPlan, ctx: &OpportunityContext) -> bool {
        let mut industries: BTreeMap<&str, usize> = BTreeMap::new();
        let mut countries: BTreeMap<&str, usize> = BTreeMap::new();
        for step in plan.steps.iter().filter(|s| s.side.is_buy()) {
            let Some(sec) = ctx.security(&step.symbol) else {
                continue;
            };
            if let Some(industry) = sec.industry.as_deref() {
                *industries.entry(industry).or_insert(0) += 1;
            }
            if let Some(country) = sec.country.as_deref() {
                *countries.entry(country).or_insert(0) += 1;
            }
        }
        industries.values().all(|&n| n <= self.params.max_same_industry)
            && countries.values().all(|&n| n <= self.params.max_same_country)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HolisticStep, Security};

    fn plan(steps: &[(&str, TradeSide)]) -> HolisticPlan {
        let steps = steps
            .iter()
            .map(|(s, side)| HolisticStep::new(*s, *side, 1, 10.0, "EUR", "test"))
            .collect();
        HolisticPlan::new(steps, "test", 1.0)
    }

    #[test]
    fn eligibility_blocks_ineligible_symbols() {
        let mut ctx = OpportunityContext::default();
        ctx.exclusions.ineligible.insert("BAD".into());
        let f = EligibilityFilter;
        assert!(f.permits(&plan(&[("OK", TradeSide::Buy)]), &ctx));
        assert!(!f.permits(&plan(&[("OK", TradeSide::Buy), ("BAD", TradeSide::Sell)]), &ctx));

        ctx.allow_sell = false;
        assert!(!f.permits(&plan(&[("OK", TradeSide::Sell)]), &ctx));
    }

    #[test]
    fn recently_traded_is_side_specific() {
        let mut ctx = OpportunityContext::default();
        ctx.exclusions.recently_sold.insert("X".into());
        let f = RecentlyTradedFilter;
        assert!(!f.permits(&plan(&[("X", TradeSide::Buy)]), &ctx));
        assert!(f.permits(&plan(&[("X", TradeSide::Sell)]), &ctx));
    }

    #[test]
    fn diversity_caps_same_industry_buys() {
        let mut ctx = OpportunityContext::default();
        for sym in ["A", "B", "C"] {
            let mut s = Security::new(sym);
            s.industry = Some("Tech".into());
            ctx.securities.push(s);
        }
        let f = create_filter(&FilterConfig::Diversity(DiversityFilterParams {
            max_same_industry: 2,
            max_same_country: 10,
        }));
        assert!(f.permits(&plan(&[("A", TradeSide::Buy), ("B", TradeSide::Buy)]), &ctx));
        assert!(!f.permits(
            &plan(&[("A", TradeSide::Buy), ("B", TradeSide::Buy), ("C", TradeSide::Buy)]),
            &ctx
        ));
        // sells do not count
        assert!(f.permits(
            &plan(&[("A", TradeSide::Buy), ("B", TradeSide::Buy), ("C", TradeSide::Sell)]),
            &ctx
        ));
    }
}
