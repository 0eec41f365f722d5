//! Single-shot planning: one snapshot in, one recommended plan out.
//!
//! [`create_plan`] runs the whole pipeline synchronously: candidate generation,
//! sequence expansion, beam search and a final report on the chosen plan.
//! Infeasibility is part of the report (`feasible = false`), never an error;
//! only invalid input fails the call.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use rebalancer_core::config::{ConfigError, PlannerConfiguration, PlanningContext};
use rebalancer_core::domain::{
    EvaluationContext, HolisticPlan, HolisticStep, ObjectiveScores, OpportunityCategory, OpportunityContext,
    PortfolioHash, Relaxation, SequenceHash, TradeSide,
};
use rebalancer_core::evaluator::{Evaluation, Evaluator};
use rebalancer_core::generator::{expand_sequences, generate_candidates, CandidateSet, RejectionReason};
use rebalancer_core::search::{beam_search, SearchOutcome};
use rebalancer_core::selector::is_pareto_optimal;

/// Rejected sequences kept in a report.
pub const MAX_REJECTED_SEQUENCES: usize = 10;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid planner configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

// ─── Report types ────────────────────────────────────────────────────

/// How the recommended plan was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBasis {
    /// Best plan of the beam-search frontier.
    Frontier,
    /// Every evaluation failed; highest-priority cash-feasible plan.
    PriorityFallback,
    /// Nothing to recommend.
    NoPlan,
}

/// Why an identified opportunity is not part of the recommended plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityRejection {
    /// Dropped before sequence generation.
    Generation(RejectionReason),
    /// In the pool, but no generated sequence contains it.
    NotSequenced,
    /// In another frontier plan that scored lower.
    InAlternative,
    /// Only in sequences that did not make the frontier.
    OutRanked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRejection {
    pub symbol: String,
    pub side: TradeSide,
    pub category: OpportunityCategory,
    pub priority: f64,
    pub reason: OpportunityRejection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSequence {
    /// 1-based rank among all evaluated sequences (feasible first, then score).
    pub rank: usize,
    pub sequence_hash: SequenceHash,
    pub origin: String,
    pub steps: usize,
    pub score: Option<f64>,
    pub feasible: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStatistics {
    pub candidates: usize,
    pub below_threshold: usize,
    /// Calculator invocations skipped after an error or panic.
    pub skipped: usize,
    pub sequences: usize,
    pub duplicates: usize,
    pub filtered: usize,
    /// Patterns or generators that failed.
    pub generation_failures: usize,
    pub evaluated: usize,
    /// Plans dropped after an evaluation error.
    pub dropped: usize,
    pub rounds: usize,
    /// Search stopped early on a score plateau.
    pub converged: bool,
}

/// The recommended plan and everything needed to explain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub portfolio_hash: PortfolioHash,
    pub steps: Vec<HolisticStep>,
    pub feasible: bool,
    pub score: Option<f64>,
    /// Composite of the current portfolio.
    pub current_score: Option<f64>,
    /// Composite after executing every step.
    pub end_state_score: Option<f64>,
    pub improvement: Option<f64>,
    pub cash_required: f64,
    pub cash_generated: f64,
    pub total_cost: f64,
    pub objectives: Option<ObjectiveScores>,
    pub pareto_optimal: bool,
    pub relaxation: Option<Relaxation>,
    pub basis: SelectionBasis,
    pub origin: Option<String>,
    pub summary: String,
    /// Remaining frontier plans, best first.
    pub alternatives: Vec<HolisticPlan>,
    pub statistics: PlanStatistics,
    pub rejected_opportunities: Vec<PlanRejection>,
    pub rejected_sequences: Vec<RejectedSequence>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ─── Planning ────────────────────────────────────────────────────────

fn validate_snapshot(ctx: &OpportunityContext) -> Result<(), PlanError> {
    if !ctx.available_cash_eur.is_finite() || ctx.available_cash_eur < 0.0 {
        return Err(PlanError::InvalidSnapshot(format!(
            "available cash must be finite and non-negative, got {}",
            ctx.available_cash_eur
        )));
    }
    for (symbol, weight) in &ctx.target_weights {
        if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
            return Err(PlanError::InvalidSnapshot(format!(
                "target weight for {symbol} must be within 0..=1, got {weight}"
            )));
        }
    }
    Ok(())
}

/// Plan the best sequence of trades for `ctx` under `cfg`.
pub fn create_plan(ctx: &OpportunityContext, cfg: &PlannerConfiguration) -> Result<Plan, PlanError> {
    cfg.validate()?;
    validate_snapshot(ctx)?;

    let hash = ctx.portfolio_hash();
    let snapshot = cfg.constrain(ctx);
    let planning = PlanningContext::from_config(cfg);
    let evaluator = Evaluator::new(planning.evaluation_mode.clone());

    let set = generate_candidates(&snapshot, cfg);
    let expansion = expand_sequences(&set, &snapshot, cfg);
    let sequences = expansion.plans.clone();
    let outcome = beam_search(
        expansion.plans,
        &set.candidates,
        &snapshot,
        &evaluator,
        &planning,
    );

    let statistics = PlanStatistics {
        candidates: set.candidates.len(),
        below_threshold: set.below_threshold.len(),
        skipped: set.skipped,
        sequences: sequences.len(),
        duplicates: expansion.duplicates,
        filtered: expansion.filtered,
        generation_failures: expansion.failures,
        evaluated: outcome.evaluated,
        dropped: outcome.dropped,
        rounds: outcome.rounds,
        converged: outcome.converged,
    };

    let (chosen, basis) = choose(&outcome, &sequences, &snapshot);
    let eval = EvaluationContext::new(&snapshot);
    let evaluation = chosen.as_ref().and_then(|plan| match evaluator.evaluate(plan, &eval) {
        Ok(e) => Some(e),
        Err(e) => {
            warn!(error = %e, "chosen plan could not be evaluated for the report");
            None
        }
    });

    let mut plan = build_plan(hash, chosen.as_ref(), evaluation.as_ref(), basis, &snapshot);
    plan.pareto_optimal = chosen
        .as_ref()
        .is_some_and(|p| basis == SelectionBasis::Frontier && is_pareto_optimal(p, &outcome.scored));
    plan.alternatives = outcome.frontier.iter().skip(1).cloned().collect();
    plan.rejected_opportunities = rejected_opportunities(&set, &sequences, &outcome, &plan);
    plan.rejected_sequences = rejected_sequences(&outcome, chosen.as_ref().map(|p| p.sequence_hash()));
    plan.statistics = statistics;
    plan.summary = summarize(&plan);

    info!(
        portfolio = plan.portfolio_hash.short(),
        steps = plan.steps.len(),
        feasible = plan.feasible,
        score = ?plan.score,
        basis = ?plan.basis,
        evaluated = plan.statistics.evaluated,
        "plan created"
    );
    Ok(plan)
}

/// Frontier best, else the highest-priority cash-feasible sequence when no
/// evaluation succeeded at all.
fn choose(
    outcome: &SearchOutcome,
    sequences: &[HolisticPlan],
    ctx: &OpportunityContext,
) -> (Option<HolisticPlan>, SelectionBasis) {
    if let Some(best) = outcome.best() {
        return (Some(best.clone()), SelectionBasis::Frontier);
    }
    if !outcome.scored.is_empty() {
        return (None, SelectionBasis::NoPlan);
    }

    let mut fallback: Option<&HolisticPlan> = None;
    for plan in sequences
        .iter()
        .filter(|p| !p.is_empty() && p.affordable_prefix(ctx.available_cash_eur, &ctx.cost_model) == p.len())
    {
        if fallback.map_or(true, |f| plan.priority > f.priority) {
            fallback = Some(plan);
        }
    }
    match fallback {
        Some(plan) => {
            info!(priority = plan.priority, origin = %plan.origin, "selected plan by priority after evaluation failures");
            (Some(plan.clone()), SelectionBasis::PriorityFallback)
        }
        None => (None, SelectionBasis::NoPlan),
    }
}

fn build_plan(
    portfolio_hash: PortfolioHash,
    chosen: Option<&HolisticPlan>,
    evaluation: Option<&Evaluation>,
    basis: SelectionBasis,
    ctx: &OpportunityContext,
) -> Plan {
    let costs = &ctx.cost_model;
    let steps = chosen.map(|p| p.steps.clone()).unwrap_or_default();
    let (cash_required, cash_generated) = match (evaluation, chosen) {
        (Some(e), _) => (e.cash_required, e.cash_generated),
        (None, Some(p)) => (p.cash_required(costs), p.cash_generated(costs)),
        (None, None) => (0.0, 0.0),
    };
    let feasible = match (basis, evaluation) {
        (SelectionBasis::Frontier, Some(e)) => e.feasible,
        (SelectionBasis::PriorityFallback, _) => true,
        _ => false,
    };

    Plan {
        portfolio_hash,
        steps,
        feasible,
        score: evaluation.map(|e| e.score),
        current_score: evaluation.map(|e| e.current_score),
        end_state_score: evaluation.map(|e| e.end_state_score),
        improvement: evaluation.map(|e| e.end_state_score - e.current_score),
        cash_required,
        cash_generated,
        total_cost: evaluation.map_or(0.0, |e| e.total_cost),
        objectives: evaluation.map(|e| e.objectives),
        pareto_optimal: false,
        relaxation: chosen.and_then(|p| p.relaxation),
        basis,
        origin: chosen.map(|p| p.origin.clone()),
        summary: String::new(),
        alternatives: Vec::new(),
        statistics: PlanStatistics::default(),
        rejected_opportunities: Vec::new(),
        rejected_sequences: Vec::new(),
    }
}

// ─── Rejections ──────────────────────────────────────────────────────

type SideKey = (String, TradeSide);

fn footprint<'a>(plans: impl Iterator<Item = &'a HolisticPlan>) -> BTreeSet<SideKey> {
    plans
        .flat_map(|p| p.steps.iter().map(|s| (s.symbol.clone(), s.side)))
        .collect()
}

/// Every identified opportunity that is not in the recommended plan, with the
/// stage at which it fell out. Sorted by symbol, then side.
fn rejected_opportunities(
    set: &CandidateSet,
    sequences: &[HolisticPlan],
    outcome: &SearchOutcome,
    plan: &Plan,
) -> Vec<PlanRejection> {
    let chosen: BTreeSet<SideKey> = plan.steps.iter().map(|s| (s.symbol.clone(), s.side)).collect();
    let sequenced = footprint(sequences.iter().chain(outcome.scored.iter()));
    let alternatives = footprint(outcome.frontier.iter().skip(1));

    let mut out: Vec<PlanRejection> = set
        .rejected
        .iter()
        .filter(|r| !chosen.contains(&(r.symbol.clone(), r.side)))
        .map(|r| PlanRejection {
            symbol: r.symbol.clone(),
            side: r.side,
            category: r.category,
            priority: r.priority,
            reason: OpportunityRejection::Generation(r.reason),
        })
        .collect();

    for candidate in &set.candidates {
        let key = (candidate.symbol().to_string(), candidate.side());
        if chosen.contains(&key) {
            continue;
        }
        let reason = if !sequenced.contains(&key) {
            OpportunityRejection::NotSequenced
        } else if alternatives.contains(&key) {
            OpportunityRejection::InAlternative
        } else {
            OpportunityRejection::OutRanked
        };
        out.push(PlanRejection {
            symbol: key.0,
            side: key.1,
            category: candidate.category,
            priority: candidate.priority,
            reason,
        });
    }

    out.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.side.as_str().cmp(b.side.as_str())));
    out
}

/// Every evaluated sequence except the winner, feasible first then by score,
/// followed by the ones that failed evaluation. Capped at
/// [`MAX_REJECTED_SEQUENCES`].
fn rejected_sequences(outcome: &SearchOutcome, winner: Option<SequenceHash>) -> Vec<RejectedSequence> {
    let mut ranked: Vec<&HolisticPlan> = outcome.scored.iter().collect();
    ranked.sort_by(|a, b| {
        b.feasible.cmp(&a.feasible).then_with(|| {
            let (sa, sb) = (a.score.unwrap_or(f64::NEG_INFINITY), b.score.unwrap_or(f64::NEG_INFINITY));
            sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
        })
    });

    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for (i, plan) in ranked.iter().enumerate() {
        let hash = plan.sequence_hash();
        if Some(&hash) == winner.as_ref() || !seen.insert(hash.clone()) {
            continue;
        }
        out.push(RejectedSequence {
            rank: i + 1,
            sequence_hash: hash,
            origin: plan.origin.clone(),
            steps: plan.len(),
            score: plan.score,
            feasible: plan.feasible,
            reason: if plan.feasible { "lower_score" } else { "infeasible" }.to_string(),
        });
    }
    let failed_rank = ranked.len();
    for (i, failure) in outcome.failures.iter().enumerate() {
        out.push(RejectedSequence {
            rank: failed_rank + i + 1,
            sequence_hash: failure.sequence_hash.clone(),
            origin: failure.origin.clone(),
            steps: 0,
            score: None,
            feasible: false,
            reason: failure.error.clone(),
        });
    }
    out.truncate(MAX_REJECTED_SEQUENCES);
    out
}

// ─── Narrative ───────────────────────────────────────────────────────

/// One-paragraph human summary of a plan.
pub fn summarize(plan: &Plan) -> String {
    if plan.steps.is_empty() {
        return match plan.basis {
            SelectionBasis::NoPlan if plan.statistics.evaluated > 0 => {
                "No feasible plan: every evaluated sequence violates a constraint.".to_string()
            }
            _ => "No action recommended.".to_string(),
        };
    }

    let mut s = format!("Execute {} action", plan.steps.len());
    if plan.steps.len() > 1 {
        s.push('s');
    }
    s.push_str(": ");
    let actions: Vec<String> = plan
        .steps
        .iter()
        .map(|step| format!("{} {} {}", step.side, step.quantity, step.symbol))
        .collect();
    s.push_str(&actions.join(", "));
    s.push('.');

    if let (Some(current), Some(end)) = (plan.current_score, plan.end_state_score) {
        let _ = write!(s, " Portfolio score {current:.3} -> {end:.3}.");
    }
    let _ = write!(
        s,
        " Needs {:.2} EUR, raises {:.2} EUR, costs {:.2} EUR.",
        plan.cash_required, plan.cash_generated, plan.total_cost
    );
    match plan.relaxation {
        Some(Relaxation::Threshold { from, to }) => {
            let _ = write!(s, " Priority threshold relaxed from {from:.2} to {to:.2}.");
        }
        Some(Relaxation::Depth { from, to }) => {
            let _ = write!(s, " Plan depth relaxed from {from} to {to}.");
        }
        None => {}
    }
    if plan.basis == SelectionBasis::PriorityFallback {
        s.push_str(" Chosen by priority because no plan could be evaluated.");
    }
    s
}
