//! Beam search over plan extensions.
//!
//! Round 1 scores the expanded plans and selects a frontier. Every later round
//! extends each frontier plan by one more candidate (a symbol the plan does not
//! touch yet), scores the unseen sequences, and reselects from the old
//! frontier plus the new plans. The search stops when a round produces no new
//! sequence; since every extension adds a step and depth is bounded, it always
//! terminates.
//!
//! With a [`ConvergencePolicy`] enabled the search also stops early once the
//! best score has plateaued. Round 1 plans are scored highest priority first so
//! the most promising sequences are seen before the plateau check applies.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ConvergencePolicy, PlanningContext};
use crate::domain::{ActionCandidate, EvaluationContext, HolisticPlan, OpportunityContext, SequenceHash};
use crate::evaluator::Evaluator;
use crate::selector::select_frontier;

/// A plan that could not be scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub sequence_hash: SequenceHash,
    pub origin: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub frontier: Vec<HolisticPlan>,
    /// Every successfully scored plan, in evaluation order.
    pub scored: Vec<HolisticPlan>,
    pub evaluated: usize,
    /// Plans dropped because evaluation failed.
    pub dropped: usize,
    pub failures: Vec<EvaluationFailure>,
    pub rounds: usize,
    /// Stopped early because the best score plateaued.
    pub converged: bool,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&HolisticPlan> {
        self.frontier.first()
    }
}

/// Plateau tracking across every scored plan of a search.
struct Plateau {
    policy: ConvergencePolicy,
    best: Option<f64>,
    since_best: usize,
}

impl Plateau {
    fn new(policy: ConvergencePolicy) -> Self {
        Self {
            policy,
            best: None,
            since_best: 0,
        }
    }

    fn observe(&mut self, plan: &HolisticPlan) {
        match plan.rank_score() {
            Some(score) if self.best.map_or(true, |best| score > best) => {
                self.best = Some(score);
                self.since_best = 0;
            }
            _ => self.since_best += 1,
        }
    }

    fn converged(&self, evaluated: usize) -> bool {
        self.policy.enabled && evaluated >= self.policy.min_evaluated && self.since_best >= self.policy.plateau
    }
}

/// Score `plans` in groups, recording failures instead of propagating them.
///
/// Stops after the group in which the plateau is reached; the remaining plans
/// are left unscored and `outcome.converged` is set.
fn score_all(
    plans: Vec<HolisticPlan>,
    evaluator: &Evaluator,
    eval: &EvaluationContext<'_>,
    plateau: &mut Plateau,
    outcome: &mut SearchOutcome,
) -> Vec<HolisticPlan> {
    let group = plateau.policy.check_every.max(1);
    let mut scored = Vec::with_capacity(plans.len());
    for (i, plan) in plans.into_iter().enumerate() {
        if i > 0 && i % group == 0 && plateau.converged(outcome.evaluated) {
            outcome.converged = true;
            break;
        }
        outcome.evaluated += 1;
        match evaluator.score_plan(&plan, eval) {
            Ok(p) => {
                plateau.observe(&p);
                scored.push(p);
            }
            Err(e) => {
                warn!(origin = %plan.origin, error = %e, "plan dropped after evaluation error");
                outcome.dropped += 1;
                outcome.failures.push(EvaluationFailure {
                    sequence_hash: plan.sequence_hash(),
                    origin: plan.origin.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    if !outcome.converged && plateau.converged(outcome.evaluated) {
        outcome.converged = true;
    }
    outcome.scored.extend(scored.iter().cloned());
    scored
}

/// `plan` followed by `candidate`, unscored.
fn extend(plan: &HolisticPlan, candidate: &ActionCandidate) -> HolisticPlan {
    let mut steps = plan.steps.clone();
    steps.push(candidate.step.clone());
    let mut next = HolisticPlan::new(steps, plan.origin.clone(), plan.priority + candidate.priority);
    next.relaxation = plan.relaxation;
    next
}

/// One-step extensions of every frontier plan that stay within `max_depth`,
/// are affordable in order, and have not been seen before.
fn extensions(
    frontier: &[HolisticPlan],
    pool: &[ActionCandidate],
    ctx: &OpportunityContext,
    max_depth: usize,
    seen: &mut HashSet<SequenceHash>,
) -> Vec<HolisticPlan> {
    let mut out = Vec::new();
    for plan in frontier.iter().filter(|p| p.len() < max_depth) {
        for candidate in pool.iter().filter(|c| !plan.touches(c.symbol())) {
            let next = extend(plan, candidate);
            if next.affordable_prefix(ctx.available_cash_eur, &ctx.cost_model) < next.len() {
                continue;
            }
            if seen.insert(next.sequence_hash()) {
                out.push(next);
            }
        }
    }
    out
}

/// Beam search seeded with `initial`, extending with candidates from `pool`.
pub fn beam_search(
    mut initial: Vec<HolisticPlan>,
    pool: &[ActionCandidate],
    ctx: &OpportunityContext,
    evaluator: &Evaluator,
    planning: &PlanningContext,
) -> SearchOutcome {
    let eval = EvaluationContext::new(ctx);
    let policy = &planning.selection;
    let mut outcome = SearchOutcome::default();
    let mut plateau = Plateau::new(planning.convergence);
    let mut seen: HashSet<SequenceHash> = initial.iter().map(|p| p.sequence_hash()).collect();

    initial.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
    let scored = score_all(initial, evaluator, &eval, &mut plateau, &mut outcome);
    outcome.frontier = select_frontier(&scored, policy);
    outcome.rounds = 1;

    while !outcome.converged {
        let next = extensions(&outcome.frontier, pool, ctx, planning.max_depth, &mut seen);
        if next.is_empty() {
            break;
        }
        let new_count = next.len();
        let mut candidates = outcome.frontier.clone();
        candidates.extend(score_all(next, evaluator, &eval, &mut plateau, &mut outcome));
        outcome.frontier = select_frontier(&candidates, policy);
        outcome.rounds += 1;
        debug!(
            round = outcome.rounds,
            new = new_count,
            frontier = outcome.frontier.len(),
            "beam round done"
        );
    }

    info!(
        rounds = outcome.rounds,
        evaluated = outcome.evaluated,
        dropped = outcome.dropped,
        frontier = outcome.frontier.len(),
        converged = outcome.converged,
        best = outcome.best().and_then(|p| p.score),
        "beam search done"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvaluationMode, PlannerConfiguration, SelectionPolicy};
    use crate::domain::{HolisticStep, OpportunityCategory, TradeSide};
    use crate::patterns::test_support::candidate;

    fn snapshot(cash: f64) -> OpportunityContext {
        let mut ctx = crate::patterns::test_support::ctx(cash);
        for s in ["A", "B", "C"] {
            ctx.prices.insert(s.to_string(), 100.0);
            ctx.target_weights.insert(s.to_string(), 0.3);
        }
        ctx
    }

    fn pool() -> Vec<ActionCandidate> {
        ["A", "B", "C"]
            .iter()
            .map(|s| candidate(s, TradeSide::Buy, 2, 100.0, 0.5, OpportunityCategory::RebalanceBuys))
            .collect()
    }

    fn planning(max_depth: usize) -> PlanningContext {
        PlanningContext {
            max_depth,
            selection: SelectionPolicy {
                beam_width: 3,
                enable_diverse_selection: false,
                diversity_weight: 0.0,
            },
            convergence: ConvergencePolicy::exhaustive(),
            ..PlanningContext::from_config(&PlannerConfiguration::default())
        }
    }

    fn seeds() -> Vec<HolisticPlan> {
        pool()
            .iter()
            .map(|c| HolisticPlan::from_candidates(std::slice::from_ref(c), "seed"))
            .collect()
    }

    #[test]
    fn grows_plans_up_to_max_depth() {
        let ctx = snapshot(1000.0);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let out = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(3));
        assert!(out.rounds >= 2);
        assert!(out.frontier.len() <= 3);
        assert!(out.scored.iter().all(|p| p.len() <= 3));
        assert_eq!(out.best().map(|p| p.len()), Some(3));
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn depth_one_never_extends() {
        let ctx = snapshot(1000.0);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let out = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(1));
        assert_eq!(out.rounds, 1);
        assert_eq!(out.evaluated, 3);
    }

    #[test]
    fn unaffordable_extensions_are_skipped() {
        // One 200 EUR buy fits, two do not.
        let ctx = snapshot(250.0);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let out = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(3));
        assert_eq!(out.rounds, 1);
        assert!(out.frontier.iter().all(|p| p.len() == 1));
    }

    #[test]
    fn evaluation_errors_drop_the_plan() {
        let mut ctx = snapshot(1000.0);
        ctx.prices.insert("A".into(), f64::NAN);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let out = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(1));
        assert_eq!(out.dropped, 1);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.frontier.len(), 2);
        assert!(out.frontier.iter().all(|p| !p.touches("A")));
    }

    #[test]
    fn search_is_deterministic() {
        let ctx = snapshot(1000.0);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let a = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(3));
        let b = beam_search(seeds(), &pool(), &ctx, &evaluator, &planning(3));
        assert_eq!(a.frontier, b.frontier);
    }

    /// Twenty one-step buys of interchangeable symbols: every score is equal.
    fn flat(ctx: &mut OpportunityContext) -> Vec<HolisticPlan> {
        (0..20)
            .map(|i| {
                let symbol = format!("S{i:02}");
                ctx.prices.insert(symbol.clone(), 100.0);
                HolisticPlan::new(
                    vec![HolisticStep::new(symbol, TradeSide::Buy, 1, 100.0, "EUR", "flat")],
                    "flat",
                    0.5,
                )
            })
            .collect()
    }

    #[test]
    fn flat_scores_converge_after_the_minimum() {
        let mut ctx = snapshot(10_000.0);
        let seeds = flat(&mut ctx);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let converging = PlanningContext {
            convergence: ConvergencePolicy::default(),
            ..planning(1)
        };

        let out = beam_search(seeds.clone(), &[], &ctx, &evaluator, &converging);
        assert!(out.converged);
        assert_eq!(out.evaluated, 10);
        assert_eq!(out.rounds, 1);
        assert!(!out.frontier.is_empty());

        let full = beam_search(seeds, &[], &ctx, &evaluator, &planning(1));
        assert!(!full.converged);
        assert_eq!(full.evaluated, 20);
    }

    #[test]
    fn improving_scores_never_converge() {
        let mut ctx = snapshot(10_000.0);
        ctx.target_weights.insert("A".into(), 0.5);
        let seeds: Vec<HolisticPlan> = (1..=20)
            .map(|q| {
                HolisticPlan::new(
                    vec![HolisticStep::new("A", TradeSide::Buy, q, 100.0, "EUR", "more")],
                    "more",
                    0.5,
                )
            })
            .collect();
        let evaluator = Evaluator::new(EvaluationMode::default());
        let converging = PlanningContext {
            convergence: ConvergencePolicy::default(),
            ..planning(1)
        };
        let out = beam_search(seeds, &[], &ctx, &evaluator, &converging);
        assert!(!out.converged);
        assert_eq!(out.evaluated, 20);
    }

    #[test]
    fn small_searches_finish_before_the_minimum() {
        let ctx = snapshot(1000.0);
        let evaluator = Evaluator::new(EvaluationMode::default());
        let converging = PlanningContext {
            convergence: ConvergencePolicy::default(),
            ..planning(1)
        };
        let out = beam_search(seeds(), &pool(), &ctx, &evaluator, &converging);
        assert!(!out.converged);
        assert_eq!(out.evaluated, 3);
    }
}
