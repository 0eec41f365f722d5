//! Plan evaluation.
//!
//! A plan is simulated against the unadjusted snapshot first; that run decides
//! feasibility. Feasible plans are then scored under the configured
//! [`EvaluationMode`]: a single deterministic run, weighted objectives, one run
//! per uniform price shift, or a set of seeded Monte-Carlo price paths.

pub mod scenarios;
pub mod scoring;
pub mod simulation;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EvaluationMode, MonteCarloParams, StochasticParams};
use crate::domain::{EvaluationContext, HolisticPlan, ObjectiveScores, PriceAdjustments};
use crate::rng::RngHierarchy;

pub use scenarios::{monte_carlo_aggregate, stochastic_aggregate};
pub use scoring::{metrics, weighted, PortfolioMetrics, ScoreBreakdown};
pub use simulation::{simulate, SimulatedState, Simulation, Violation};

/// Undefined numeric state reached while evaluating one plan.
///
/// The plan is dropped; the run continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("non-finite price for {symbol}: {price}")]
    NonFinitePrice { symbol: String, price: f64 },

    #[error("non-finite cash balance: {0}")]
    NonFiniteCash(f64),

    #[error("score is not finite")]
    NonFiniteScore,
}

/// Full outcome of evaluating one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub feasible: bool,
    pub violations: Vec<Violation>,
    pub objectives: ObjectiveScores,
    /// Composite of the starting state.
    pub current_score: f64,
    /// Composite of the simulated end state.
    pub end_state_score: f64,
    pub total_cost: f64,
    pub cash_required: f64,
    pub cash_generated: f64,
    /// Per-scenario scores; empty for the deterministic modes.
    pub scenario_scores: Vec<f64>,
}

/// Scores plans under one evaluation mode.
#[derive(Debug, Clone)]
pub struct Evaluator {
    mode: EvaluationMode,
}

impl Evaluator {
    pub fn new(mode: EvaluationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &EvaluationMode {
        &self.mode
    }

    pub fn evaluate(&self, plan: &HolisticPlan, eval: &EvaluationContext<'_>) -> Result<Evaluation, EvaluationError> {
        let base = simulate(plan, eval)?;
        let breakdown = ScoreBreakdown::of(&base, eval.snapshot);
        let objectives = breakdown.objectives();

        let mut evaluation = Evaluation {
            score: breakdown.score(),
            feasible: base.feasible(),
            violations: base.violations.clone(),
            objectives,
            current_score: breakdown.start.composite(),
            end_state_score: breakdown.end.composite(),
            total_cost: base.total_cost,
            cash_required: base.cash_spent,
            cash_generated: base.cash_raised,
            scenario_scores: Vec::new(),
        };

        if evaluation.feasible {
            match &self.mode {
                EvaluationMode::SingleObjective(_) => {}
                EvaluationMode::MultiObjective(weights) => {
                    evaluation.score = weighted(&objectives, weights);
                }
                EvaluationMode::Stochastic(params) => {
                    let scores = stochastic_scores(plan, eval, params)?;
                    if !scores.is_empty() {
                        evaluation.score = stochastic_aggregate(&scores);
                    }
                    evaluation.scenario_scores = scores;
                }
                EvaluationMode::MonteCarlo(params) => {
                    let scores = monte_carlo_scores(plan, eval, params)?;
                    if !scores.is_empty() {
                        evaluation.score = monte_carlo_aggregate(&scores);
                    }
                    evaluation.scenario_scores = scores;
                }
            }
        }

        if !evaluation.score.is_finite() || !evaluation.objectives.is_finite() {
            return Err(EvaluationError::NonFiniteScore);
        }
        Ok(evaluation)
    }

    /// Evaluated copy of `plan`.
    pub fn score_plan(&self, plan: &HolisticPlan, eval: &EvaluationContext<'_>) -> Result<HolisticPlan, EvaluationError> {
        let e = self.evaluate(plan, eval)?;
        Ok(plan.scored(e.score, e.feasible, Some(e.objectives)))
    }
}

/// Score of `plan` under `mode`.
pub fn evaluate(
    plan: &HolisticPlan,
    eval: &EvaluationContext<'_>,
    mode: &EvaluationMode,
) -> Result<f64, EvaluationError> {
    Evaluator::new(mode.clone()).evaluate(plan, eval).map(|e| e.score)
}

fn scenario_score(plan: &HolisticPlan, eval: &EvaluationContext<'_>) -> Result<f64, EvaluationError> {
    let sim = simulate(plan, eval)?;
    Ok(ScoreBreakdown::of(&sim, eval.snapshot).score())
}

fn stochastic_scores(
    plan: &HolisticPlan,
    eval: &EvaluationContext<'_>,
    params: &StochasticParams,
) -> Result<Vec<f64>, EvaluationError> {
    params
        .shifts
        .iter()
        .map(|&shift| scenario_score(plan, &eval.with_adjustments(PriceAdjustments::Uniform(shift))))
        .collect()
}

fn monte_carlo_scores(
    plan: &HolisticPlan,
    eval: &EvaluationContext<'_>,
    params: &MonteCarloParams,
) -> Result<Vec<f64>, EvaluationError> {
    let symbols: Vec<String> = eval
        .snapshot
        .positions
        .iter()
        .map(|p| p.symbol.clone())
        .chain(plan.steps.iter().map(|s| s.symbol.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let seeds = RngHierarchy::new(params.seed);
    let sequence = plan.sequence_hash();

    (0..params.paths as u64)
        .map(|path| {
            let mut rng = seeds.rng_for(&eval.portfolio_hash, &sequence, path);
            let multipliers =
                scenarios::sample_multipliers(&mut rng, &symbols, eval.snapshot, params.default_volatility);
            scenario_score(plan, &eval.with_adjustments(PriceAdjustments::PerSymbol(multipliers)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmptyParams, ObjectiveWeights};
    use crate::cost_model::CostModel;
    use crate::domain::{HolisticStep, OpportunityContext, Position, TradeSide};

    fn snapshot() -> OpportunityContext {
        OpportunityContext {
            available_cash_eur: 1000.0,
            prices: [("X".to_string(), 100.0)].into_iter().collect(),
            target_weights: [("X".to_string(), 0.5)].into_iter().collect(),
            cost_model: CostModel::new(1.0, 0.0),
            ..Default::default()
        }
    }

    fn buy_x(qty: u64) -> HolisticPlan {
        HolisticPlan::new(
            vec![HolisticStep::new("X", TradeSide::Buy, qty, 100.0, "EUR", "test")],
            "test",
            1.0,
        )
    }

    #[test]
    fn buying_toward_target_improves_score() {
        let snap = snapshot();
        let eval = EvaluationContext::new(&snap);
        let e = Evaluator::new(EvaluationMode::default()).evaluate(&buy_x(5), &eval).unwrap();
        assert!(e.feasible);
        assert!(e.score > 0.0);
        assert!(e.end_state_score > e.current_score);
        assert!((e.cash_required - 501.0).abs() < 1e-9);
        assert!(e.scenario_scores.is_empty());
    }

    #[test]
    fn infeasible_plan_keeps_base_score() {
        let snap = snapshot();
        let eval = EvaluationContext::new(&snap);
        let mode = EvaluationMode::Stochastic(StochasticParams::default());
        let e = Evaluator::new(mode).evaluate(&buy_x(20), &eval).unwrap();
        assert!(!e.feasible);
        assert_eq!(e.violations.len(), 1);
        assert!(e.scenario_scores.is_empty());
    }

    #[test]
    fn two_shifts_run_twice_and_aggregate_between() {
        let snap = snapshot();
        let eval = EvaluationContext::new(&snap);
        let mode = EvaluationMode::Stochastic(StochasticParams {
            shifts: vec![-0.10, 0.10],
        });
        let e = Evaluator::new(mode).evaluate(&buy_x(1), &eval).unwrap();
        assert_eq!(e.scenario_scores.len(), 2);
        let lo = e.scenario_scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = e.scenario_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(lo <= e.score && e.score <= hi);
    }

    #[test]
    fn monte_carlo_is_deterministic() {
        let mut snap = snapshot();
        snap.positions.push(Position {
            symbol: "X".into(),
            quantity: 2,
            average_cost: 90.0,
            currency: "EUR".into(),
        });
        let eval = EvaluationContext::new(&snap);
        let mode = EvaluationMode::MonteCarlo(MonteCarloParams {
            paths: 20,
            ..Default::default()
        });
        let a = Evaluator::new(mode.clone()).evaluate(&buy_x(3), &eval).unwrap();
        let b = Evaluator::new(mode).evaluate(&buy_x(3), &eval).unwrap();
        assert_eq!(a.scenario_scores.len(), 20);
        assert_eq!(a, b);
    }

    #[test]
    fn multi_objective_uses_weights() {
        let snap = snapshot();
        let eval = EvaluationContext::new(&snap);
        let weights = ObjectiveWeights {
            allocation_fit: 1.0,
            diversification: 0.0,
            risk: 0.0,
            cost_efficiency: 0.0,
        };
        let e = Evaluator::new(EvaluationMode::MultiObjective(weights))
            .evaluate(&buy_x(5), &eval)
            .unwrap();
        assert!((e.score - e.objectives.allocation_fit).abs() < 1e-12);
    }

    #[test]
    fn free_function_matches_evaluator() {
        let snap = snapshot();
        let eval = EvaluationContext::new(&snap);
        let mode = EvaluationMode::SingleObjective(EmptyParams {});
        let s = evaluate(&buy_x(2), &eval, &mode).unwrap();
        let scored = Evaluator::new(mode).score_plan(&buy_x(2), &eval).unwrap();
        assert_eq!(scored.score, Some(s));
        assert!(scored.rank_score().is_some());
    }

    #[test]
    fn infinite_cash_is_an_error() {
        let mut snap = snapshot();
        snap.available_cash_eur = f64::INFINITY;
        let eval = EvaluationContext::new(&snap);
        assert!(matches!(
            evaluate(&buy_x(1), &eval, &EvaluationMode::default()),
            Err(EvaluationError::NonFiniteCash(_))
        ));
    }
}
