//! Step-by-step application of a plan to a private copy of cash and holdings.
//!
//! The simulated state is owned by one evaluation and never shared. A step
//! that breaks a hard constraint is recorded as a [`Violation`] and not
//! applied; later steps still run so every violation is reported.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{EvaluationContext, HolisticPlan, TradeSide};

use super::EvaluationError;

/// Tolerance for cash comparisons.
const CASH_EPSILON: f64 = 1e-9;

/// A hard-constraint breach found while simulating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    InsufficientCash {
        symbol: String,
        required: f64,
        available: f64,
    },
    InsufficientQuantity {
        symbol: String,
        requested: u64,
        held: u64,
    },
    SideNotAllowed {
        symbol: String,
        side: TradeSide,
    },
    Ineligible {
        symbol: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCash {
                symbol,
                required,
                available,
            } => write!(f, "{symbol}: needs {required:.2} cash, {available:.2} available"),
            Self::InsufficientQuantity {
                symbol,
                requested,
                held,
            } => write!(f, "{symbol}: sells {requested}, holds {held}"),
            Self::SideNotAllowed { symbol, side } => write!(f, "{symbol}: {side} not allowed"),
            Self::Ineligible { symbol } => write!(f, "{symbol}: ineligible"),
        }
    }
}

/// Cash + holdings at one point of a simulation, valued at scenario prices.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedState {
    pub cash: f64,
    pub holdings: BTreeMap<String, u64>,
    /// Scenario price per symbol; 0 where no usable price exists.
    pub prices: BTreeMap<String, f64>,
}

impl SimulatedState {
    pub fn price(&self, symbol: &str) -> f64 {
        self.prices.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn position_value(&self, symbol: &str) -> f64 {
        self.holdings.get(symbol).map_or(0.0, |&q| q as f64 * self.price(symbol))
    }

    pub fn invested_value(&self) -> f64 {
        self.holdings.keys().map(|s| self.position_value(s)).sum()
    }

    pub fn total_value(&self) -> f64 {
        self.cash.max(0.0) + self.invested_value()
    }
}

/// Result of running a plan through one price scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    pub start: SimulatedState,
    pub end: SimulatedState,
    pub violations: Vec<Violation>,
    pub total_cost: f64,
    /// Cash paid for BUY steps, costs included.
    pub cash_spent: f64,
    /// Cash received from SELL steps, net of costs.
    pub cash_raised: f64,
}

impl Simulation {
    pub fn feasible(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Resolve a scenario price. No price at all is a zero contribution; a NaN or
/// infinite price is an error.
fn resolve_price(
    eval: &EvaluationContext<'_>,
    symbol: &str,
    fallback: Option<f64>,
) -> Result<f64, EvaluationError> {
    let raw = eval
        .raw_price(symbol)
        .or_else(|| fallback.map(|p| eval.adjust(symbol, p)));
    match raw {
        None => Ok(0.0),
        Some(p) if !p.is_finite() => Err(EvaluationError::NonFinitePrice {
            symbol: symbol.to_string(),
            price: p,
        }),
        Some(p) if p <= 0.0 => Ok(0.0),
        Some(p) => Ok(p),
    }
}

fn start_state(plan: &HolisticPlan, eval: &EvaluationContext<'_>) -> Result<SimulatedState, EvaluationError> {
    let snapshot = eval.snapshot;
    let mut holdings: BTreeMap<String, u64> = BTreeMap::new();
    for p in &snapshot.positions {
        *holdings.entry(p.symbol.clone()).or_insert(0) += p.quantity;
    }

    let mut prices = BTreeMap::new();
    for symbol in holdings.keys() {
        prices.insert(symbol.clone(), resolve_price(eval, symbol, None)?);
    }
    for step in &plan.steps {
        if !prices.contains_key(&step.symbol) || prices[&step.symbol] == 0.0 {
            let price = resolve_price(eval, &step.symbol, Some(step.estimated_price))?;
            prices.insert(step.symbol.clone(), price);
        }
    }

    if !snapshot.available_cash_eur.is_finite() {
        return Err(EvaluationError::NonFiniteCash(snapshot.available_cash_eur));
    }
    Ok(SimulatedState {
        cash: snapshot.available_cash_eur,
        holdings,
        prices,
    })
}

/// Apply every step of `plan` under the prices of `eval`.
pub fn simulate(plan: &HolisticPlan, eval: &EvaluationContext<'_>) -> Result<Simulation, EvaluationError> {
    let snapshot = eval.snapshot;
    let costs = &snapshot.cost_model;
    let start = start_state(plan, eval)?;
    let mut state = start.clone();
    let mut violations = Vec::new();
    let mut total_cost = 0.0;
    let mut cash_spent = 0.0;
    let mut cash_raised = 0.0;

    for step in &plan.steps {
        let symbol = step.symbol.as_str();
        if snapshot.exclusions.ineligible.contains(symbol) {
            violations.push(Violation::Ineligible {
                symbol: symbol.to_string(),
            });
            continue;
        }
        if !snapshot.side_allowed(symbol, step.side) {
            violations.push(Violation::SideNotAllowed {
                symbol: symbol.to_string(),
                side: step.side,
            });
            continue;
        }

        let value = step.quantity as f64 * state.price(symbol);
        let cost = costs.cost(value);
        match step.side {
            TradeSide::Buy => {
                let required = value + cost;
                if required > state.cash.max(0.0) + CASH_EPSILON {
                    violations.push(Violation::InsufficientCash {
                        symbol: symbol.to_string(),
                        required,
                        available: state.cash,
                    });
                    continue;
                }
                state.cash -= required;
                *state.holdings.entry(symbol.to_string()).or_insert(0) += step.quantity;
                cash_spent += required;
            }
            TradeSide::Sell => {
                let held = state.holdings.get(symbol).copied().unwrap_or(0);
                if step.quantity > held {
                    violations.push(Violation::InsufficientQuantity {
                        symbol: symbol.to_string(),
                        requested: step.quantity,
                        held,
                    });
                    continue;
                }
                let proceeds = value - cost;
                state.cash += proceeds;
                if held == step.quantity {
                    state.holdings.remove(symbol);
                } else {
                    state.holdings.insert(symbol.to_string(), held - step.quantity);
                }
                cash_raised += proceeds;
            }
        }
        total_cost += cost;
    }

    Ok(Simulation {
        start,
        end: state,
        violations,
        total_cost,
        cash_spent,
        cash_raised,
    })
}
