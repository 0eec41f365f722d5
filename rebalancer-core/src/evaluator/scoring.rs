//! End-state metrics and the scores derived from them.
//!
//! Three portfolio metrics, each in `[0, 1]`, higher is better:
//! - allocation fit: `1 - ½ Σ|w - target|`, cash taking the residual target
//! - diversification: `1 - HHI` of the invested weights
//! - risk: `1 - Σ w × volatility`, clamped
//!
//! A plan's score is the composite at its end state minus the composite at the
//! start, minus cost drag (`total cost / starting value`). Every division by a
//! zero total falls back to a zero contribution.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::ObjectiveWeights;
use crate::domain::{ObjectiveScores, OpportunityContext};

use super::simulation::{SimulatedState, Simulation};

/// Volatility assumed for securities without an estimate.
pub const DEFAULT_VOLATILITY: f64 = 0.2;

const FIT_WEIGHT: f64 = 0.6;
const DIVERSIFICATION_WEIGHT: f64 = 0.2;
const RISK_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub allocation_fit: f64,
    pub diversification: f64,
    pub risk: f64,
}

impl PortfolioMetrics {
    pub fn composite(&self) -> f64 {
        FIT_WEIGHT * self.allocation_fit + DIVERSIFICATION_WEIGHT * self.diversification + RISK_WEIGHT * self.risk
    }
}

pub fn metrics(state: &SimulatedState, snapshot: &OpportunityContext) -> PortfolioMetrics {
    let total = state.total_value();
    if total.is_nan() || total <= 0.0 {
        return PortfolioMetrics::default();
    }
    let weight = |symbol: &str| state.position_value(symbol) / total;

    // Allocation fit
    let allocation_fit = if snapshot.target_weights.is_empty() {
        1.0
    } else {
        let symbols: BTreeSet<&str> = snapshot
            .target_weights
            .keys()
            .map(String::as_str)
            .chain(state.holdings.keys().map(String::as_str))
            .collect();
        let targeted: f64 = snapshot.target_weights.values().filter(|t| t.is_finite()).sum();
        let cash_target = (1.0 - targeted).max(0.0);
        let cash_weight = state.cash.max(0.0) / total;

        let mut deviation = (cash_weight - cash_target).abs();
        for symbol in symbols {
            let target = snapshot
                .target_weights
                .get(symbol)
                .copied()
                .filter(|t| t.is_finite())
                .unwrap_or(0.0);
            deviation += (weight(symbol) - target).abs();
        }
        (1.0 - 0.5 * deviation).clamp(0.0, 1.0)
    };

    // Diversification over invested weights only
    let invested = state.invested_value();
    let diversification = if invested > 0.0 {
        let hhi: f64 = state
            .holdings
            .keys()
            .map(|s| {
                let w = state.position_value(s) / invested;
                w * w
            })
            .sum();
        1.0 - hhi
    } else {
        0.0
    };

    let exposure: f64 = state
        .holdings
        .keys()
        .map(|s| {
            let vol = snapshot
                .security(s)
                .and_then(|sec| sec.volatility)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(DEFAULT_VOLATILITY);
            weight(s) * vol
        })
        .sum();
    let risk = (1.0 - exposure).clamp(0.0, 1.0);

    PortfolioMetrics {
        allocation_fit,
        diversification,
        risk,
    }
}

/// Metrics at both ends of a simulation plus the derived scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub start: PortfolioMetrics,
    pub end: PortfolioMetrics,
    pub cost_drag: f64,
}

impl ScoreBreakdown {
    pub fn of(sim: &Simulation, snapshot: &OpportunityContext) -> Self {
        let start_total = sim.start.total_value();
        let cost_drag = if start_total > 0.0 {
            sim.total_cost / start_total
        } else {
            0.0
        };
        Self {
            start: metrics(&sim.start, snapshot),
            end: metrics(&sim.end, snapshot),
            cost_drag,
        }
    }

    /// Single-objective score: composite improvement minus cost drag.
    pub fn score(&self) -> f64 {
        self.end.composite() - self.start.composite() - self.cost_drag
    }

    /// Per-objective improvements.
    pub fn objectives(&self) -> ObjectiveScores {
        ObjectiveScores {
            allocation_fit: self.end.allocation_fit - self.start.allocation_fit,
            diversification: self.end.diversification - self.start.diversification,
            risk: self.end.risk - self.start.risk,
            cost_efficiency: -self.cost_drag,
        }
    }
}

/// Weighted combination of objective improvements.
pub fn weighted(objectives: &ObjectiveScores, weights: &ObjectiveWeights) -> f64 {
    objectives.allocation_fit * weights.allocation_fit
        + objectives.diversification * weights.diversification
        + objectives.risk * weights.risk
        + objectives.cost_efficiency * weights.cost_efficiency
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Security;
    use std::collections::BTreeMap;

    fn state(cash: f64, holdings: &[(&str, u64, f64)]) -> SimulatedState {
        SimulatedState {
            cash,
            holdings: holdings.iter().map(|(s, q, _)| (s.to_string(), *q)).collect(),
            prices: holdings.iter().map(|(s, _, p)| (s.to_string(), *p)).collect(),
        }
    }

    #[test]
    fn empty_portfolio_scores_zero() {
        let m = metrics(&state(0.0, &[]), &OpportunityContext::default());
        assert_eq!(m, PortfolioMetrics::default());
    }

    #[test]
    fn perfect_fit_is_one() {
        let mut snap = OpportunityContext::default();
        snap.target_weights = BTreeMap::from([("A".to_string(), 0.5), ("B".to_string(), 0.5)]);
        let m = metrics(&state(0.0, &[("A", 10, 10.0), ("B", 5, 20.0)]), &snap);
        assert!((m.allocation_fit - 1.0).abs() < 1e-12);
        assert!((m.diversification - 0.5).abs() < 1e-12);
    }

    #[test]
    fn all_cash_against_full_target_fits_zero() {
        let mut snap = OpportunityContext::default();
        snap.target_weights.insert("A".into(), 1.0);
        let m = metrics(&state(100.0, &[]), &snap);
        assert!(m.allocation_fit.abs() < 1e-12);
        assert_eq!(m.diversification, 0.0);
        assert_eq!(m.risk, 1.0);
    }

    #[test]
    fn risk_uses_security_volatility() {
        let mut snap = OpportunityContext::default();
        let mut sec = Security::new("A");
        sec.volatility = Some(0.5);
        snap.securities.push(sec);
        let m = metrics(&state(0.0, &[("A", 1, 100.0)]), &snap);
        assert!((m.risk - 0.5).abs() < 1e-12);

        let m = metrics(&state(0.0, &[("B", 1, 100.0)]), &snap);
        assert!((m.risk - 0.8).abs() < 1e-12);
    }

    #[test]
    fn weighted_sum() {
        let o = ObjectiveScores {
            allocation_fit: 1.0,
            diversification: 1.0,
            risk: 1.0,
            cost_efficiency: -1.0,
        };
        let w = ObjectiveWeights::default();
        assert!((weighted(&o, &w) - 0.6).abs() < 1e-12);
    }
}
