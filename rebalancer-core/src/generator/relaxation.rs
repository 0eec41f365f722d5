//! Constraint relaxation notches.
//!
//! Notch 1 lowers the priority threshold by `threshold_step` and re-admits the
//! candidates that were dropped for falling under it. Notch 2 keeps the
//! relaxed pool and restricts plans to a single step.

use std::cmp::Ordering;

use crate::domain::{ActionCandidate, HolisticPlan, OpportunityContext, Relaxation};

/// Threshold after one notch, floored at zero.
pub fn lowered_threshold(threshold: f64, step: f64) -> f64 {
    (threshold - step).max(0.0)
}

/// `candidates` plus every below-threshold candidate whose priority reaches
/// `threshold`, sorted by priority (stable).
pub fn relaxed_pool(
    candidates: &[ActionCandidate],
    below_threshold: &[ActionCandidate],
    threshold: f64,
) -> Vec<ActionCandidate> {
    let mut pool: Vec<ActionCandidate> = candidates
        .iter()
        .chain(below_threshold.iter().filter(|c| c.priority >= threshold))
        .cloned()
        .collect();
    pool.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(Ordering::Equal));
    pool
}

/// Every affordable candidate on its own.
pub fn single_step_plans(pool: &[ActionCandidate], ctx: &OpportunityContext) -> Vec<HolisticPlan> {
    pool.iter()
        .filter(|c| {
            !c.side().is_buy() || ctx.cost_model.buy_total(c.value()) <= ctx.available_cash_eur.max(0.0)
        })
        .map(|c| HolisticPlan::from_candidates(std::slice::from_ref(c), "constraint_relaxation"))
        .collect()
}

pub fn tag(plans: Vec<HolisticPlan>, relaxation: Relaxation) -> Vec<HolisticPlan> {
    plans.into_iter().map(|p| p.with_relaxation(relaxation)).collect()
}
