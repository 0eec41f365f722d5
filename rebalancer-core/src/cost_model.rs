//! Transaction cost model: fixed fee plus a percentage of trade value.
//!
//! Every step costs `fixed + value * percent`. Buyers pay the cost on top of
//! the trade value, sellers receive the value net of the cost.

use serde::{Deserialize, Serialize};

/// Per-trade friction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Flat fee per trade, in EUR.
    pub fixed: f64,
    /// Fraction of trade value (0.001 = 0.1%).
    pub percent: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fixed: 5.0,
            percent: 0.001,
        }
    }
}

impl CostModel {
    pub fn new(fixed: f64, percent: f64) -> Self {
        Self { fixed, percent }
    }

    pub fn frictionless() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Cost of a trade worth `value`.
    ///
    /// Zero or non-finite values cost nothing: a step that moves no money
    /// contributes nothing to the plan.
    pub fn cost(&self, value: f64) -> f64 {
        if !value.is_finite() || value <= 0.0 {
            return 0.0;
        }
        self.fixed + value * self.percent
    }

    /// Cash needed to buy `value`.
    pub fn buy_total(&self, value: f64) -> f64 {
        if !value.is_finite() || value <= 0.0 {
            return 0.0;
        }
        value + self.cost(value)
    }

    /// Cash received from selling `value`.
    pub fn sell_proceeds(&self, value: f64) -> f64 {
        if !value.is_finite() || value <= 0.0 {
            return 0.0;
        }
        value - self.cost(value)
    }

    /// A trade is worth doing only if its value covers at least twice its cost.
    pub fn is_worthwhile(&self, value: f64) -> bool {
        value.is_finite() && value > 0.0 && value >= 2.0 * self.cost(value)
    }

    /// Smallest trade value whose cost ratio stays at or below `max_cost_ratio`.
    ///
    /// `fixed / (max_cost_ratio - percent)`; infinite when the percentage fee
    /// alone already exceeds the ratio.
    pub fn min_trade_amount(&self, max_cost_ratio: f64) -> f64 {
        let headroom = max_cost_ratio - self.percent;
        if headroom <= 0.0 {
            return f64::INFINITY;
        }
        self.fixed / headroom
    }
}
