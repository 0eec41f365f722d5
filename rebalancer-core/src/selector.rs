//! Frontier selection: bounded, deduplicated, diversity-aware.
//!
//! Plans without a rank score (unscored, infeasible, non-finite) never enter
//! the frontier. The remaining plans are stably sorted by score, deduplicated
//! by sequence hash, and then either truncated to the beam width or picked
//! greedily by diversity-adjusted score:
//!
//! `adjusted = score × (1 − w) + diversity × w`
//!
//! where `diversity` is measured against the plans already accepted in this
//! selection, so the first pick is always the best-scoring plan. Ties keep the
//! earlier plan, which makes the output a pure function of the input order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::config::SelectionPolicy;
use crate::domain::{HolisticPlan, TradeSide};

type Footprint = BTreeSet<(String, TradeSide)>;

/// Jaccard similarity of two `(symbol, side)` sets. Two empty sets are identical.
pub fn overlap(a: &Footprint, b: &Footprint) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// `1 − max overlap` against the accepted footprints; `1` when none are accepted.
pub fn diversity(plan: &Footprint, accepted: &[Footprint]) -> f64 {
    let max = accepted.iter().map(|a| overlap(plan, a)).fold(0.0, f64::max);
    1.0 - max
}

/// Rankable plans, best first, one per sequence hash.
fn ranked(plans: &[HolisticPlan]) -> Vec<(f64, &HolisticPlan)> {
    let mut scored: Vec<(f64, &HolisticPlan)> = plans
        .iter()
        .filter_map(|p| p.rank_score().map(|s| (s, p)))
        .collect();
    // sort_by is stable: equal scores keep input order
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut seen = HashSet::new();
    scored.retain(|(_, p)| seen.insert(p.sequence_hash()));
    scored
}

/// Select at most `policy.beam_width` plans from `plans`.
pub fn select_frontier(plans: &[HolisticPlan], policy: &SelectionPolicy) -> Vec<HolisticPlan> {
    let ranked = ranked(plans);
    let width = policy.beam_width;

    if !policy.enable_diverse_selection || policy.diversity_weight <= 0.0 {
        return ranked.into_iter().take(width).map(|(_, p)| p.clone()).collect();
    }

    let w = policy.diversity_weight.clamp(0.0, 1.0);
    let mut remaining: Vec<(f64, &HolisticPlan, Footprint)> =
        ranked.into_iter().map(|(s, p)| (s, p, p.footprint())).collect();
    let mut accepted: Vec<Footprint> = Vec::with_capacity(width.min(remaining.len()));
    let mut frontier = Vec::with_capacity(width.min(remaining.len()));

    while frontier.len() < width && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_adjusted = f64::NEG_INFINITY;
        for (idx, (score, _, footprint)) in remaining.iter().enumerate() {
            let adjusted = score * (1.0 - w) + diversity(footprint, &accepted) * w;
            // strict: ties keep the earlier plan
            if adjusted > best_adjusted {
                best_adjusted = adjusted;
                best_idx = idx;
            }
        }
        let (_, plan, footprint) = remaining.remove(best_idx);
        accepted.push(footprint);
        frontier.push(plan.clone());
    }

    debug!(
        candidates = plans.len(),
        selected = frontier.len(),
        diversity_weight = w,
        "frontier selected"
    );
    frontier
}

/// Indices of the plans whose objectives no other plan dominates.
///
/// Only feasible plans with objectives take part.
pub fn pareto_front(plans: &[HolisticPlan]) -> Vec<usize> {
    let eligible: Vec<(usize, _)> = plans
        .iter()
        .enumerate()
        .filter(|(_, p)| p.rank_score().is_some())
        .filter_map(|(i, p)| p.objectives.map(|o| (i, o)))
        .collect();

    eligible
        .iter()
        .filter(|(_, o)| !eligible.iter().any(|(_, other)| other.dominates(o)))
        .map(|(i, _)| *i)
        .collect()
}

/// Whether no rankable plan in `others` dominates `plan`.
pub fn is_pareto_optimal(plan: &HolisticPlan, others: &[HolisticPlan]) -> bool {
    let Some(own) = plan.objectives else {
        return false;
    };
    !others
        .iter()
        .filter(|p| p.rank_score().is_some())
        .filter_map(|p| p.objectives)
        .any(|o| o.dominates(&own))
}
