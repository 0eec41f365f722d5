//! Candidate plans: ordered step lists plus their evaluation state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::SequenceHash;
use super::step::{ActionCandidate, HolisticStep, TradeSide};
use crate::cost_model::CostModel;
use crate::fingerprint::sequence_hash;

/// Marks a plan produced after constraints were loosened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relaxation {
    /// Priority threshold lowered from `from` to `to`.
    Threshold { from: f64, to: f64 },
    /// Plan depth restricted from `from` to `to` steps on top of a threshold relaxation.
    Depth { from: usize, to: usize },
}

/// Objective improvements of a plan's end state over the starting state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveScores {
    pub allocation_fit: f64,
    pub diversification: f64,
    pub risk: f64,
    pub cost_efficiency: f64,
}

impl ObjectiveScores {
    fn as_array(&self) -> [f64; 4] {
        [
            self.allocation_fit,
            self.diversification,
            self.risk,
            self.cost_efficiency,
        ]
    }

    /// Pareto dominance: at least as good everywhere, strictly better somewhere.
    pub fn dominates(&self, other: &ObjectiveScores) -> bool {
        let a = self.as_array();
        let b = other.as_array();
        let no_worse = a.iter().zip(&b).all(|(x, y)| x >= y);
        let better = a.iter().zip(&b).any(|(x, y)| x > y);
        no_worse && better
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

/// An ordered candidate plan.
///
/// Created by the sequence generator, scored by the evaluator, ranked by the
/// selector. Immutable once scored: scoring produces a new value via
/// [`HolisticPlan::scored`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolisticPlan {
    pub steps: Vec<HolisticStep>,
    pub feasible: bool,
    /// End-state score; `None` until evaluated.
    pub score: Option<f64>,
    pub objectives: Option<ObjectiveScores>,
    /// Generation depth (number of steps when created).
    pub depth: usize,
    /// Pattern or generator that produced this plan.
    pub origin: String,
    /// Sum of the priorities of the candidates that make up the plan.
    pub priority: f64,
    pub relaxation: Option<Relaxation>,
    /// Affordable prefix of a larger template.
    pub partial: bool,
}

impl HolisticPlan {
    pub fn new(steps: Vec<HolisticStep>, origin: impl Into<String>, priority: f64) -> Self {
        let depth = steps.len();
        Self {
            steps,
            feasible: true,
            score: None,
            objectives: None,
            depth,
            origin: origin.into(),
            priority,
            relaxation: None,
            partial: false,
        }
    }

    pub fn from_candidates(candidates: &[ActionCandidate], origin: impl Into<String>) -> Self {
        let steps = candidates.iter().map(|c| c.step.clone()).collect();
        let priority = candidates.iter().map(|c| c.priority).sum();
        Self::new(steps, origin, priority)
    }

    pub fn with_relaxation(mut self, relaxation: Relaxation) -> Self {
        self.relaxation = Some(relaxation);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn sequence_hash(&self) -> SequenceHash {
        sequence_hash(&self.steps)
    }

    /// Evaluated copy of this plan.
    pub fn scored(&self, score: f64, feasible: bool, objectives: Option<ObjectiveScores>) -> Self {
        Self {
            score: Some(score),
            feasible,
            objectives,
            ..self.clone()
        }
    }

    /// Score usable for ranking: feasible, evaluated and finite.
    pub fn rank_score(&self) -> Option<f64> {
        match self.score {
            Some(s) if self.feasible && s.is_finite() => Some(s),
            _ => None,
        }
    }

    pub fn touches(&self, symbol: &str) -> bool {
        self.steps.iter().any(|s| s.symbol == symbol)
    }

    /// Distinct `(symbol, side)` pairs, used for overlap measurement.
    pub fn footprint(&self) -> BTreeSet<(String, TradeSide)> {
        self.steps
            .iter()
            .map(|s| (s.symbol.clone(), s.side))
            .collect()
    }

    /// Cash spent by BUY steps, including transaction costs.
    pub fn cash_required(&self, costs: &CostModel) -> f64 {
        self.steps
            .iter()
            .filter(|s| s.side.is_buy())
            .map(|s| costs.buy_total(s.estimated_value))
            .sum()
    }

    /// Cash released by SELL steps, net of transaction costs.
    pub fn cash_generated(&self, costs: &CostModel) -> f64 {
        self.steps
            .iter()
            .filter(|s| s.side.is_sell())
            .map(|s| costs.sell_proceeds(s.estimated_value))
            .sum()
    }

    /// Number of leading steps that stay cash-feasible at estimated prices.
    pub fn affordable_prefix(&self, available_cash: f64, costs: &CostModel) -> usize {
        affordable_prefix(&self.steps, available_cash, costs)
    }
}

/// Walk the steps in order and return how many leading steps can be paid for.
///
/// Sell proceeds become available to later buys.
pub fn affordable_prefix(steps: &[HolisticStep], available_cash: f64, costs: &CostModel) -> usize {
    let mut cash = available_cash.max(0.0);
    for (i, step) in steps.iter().enumerate() {
        match step.side {
            TradeSide::Buy => {
                let total = costs.buy_total(step.estimated_value);
                if total > cash {
                    return i;
                }
                cash -= total;
            }
            TradeSide::Sell => cash += costs.sell_proceeds(step.estimated_value),
        }
    }
    steps.len()
}
