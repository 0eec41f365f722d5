//! Atomic trade actions and the candidates that propose them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a single trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::Sell)
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic action inside a plan. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolisticStep {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: u64,
    pub estimated_price: f64,
    pub estimated_value: f64,
    pub currency: String,
    pub reason: String,
}

impl HolisticStep {
    pub fn new(
        symbol: impl Into<String>,
        side: TradeSide,
        quantity: u64,
        estimated_price: f64,
        currency: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let estimated_value = if estimated_price.is_finite() && estimated_price > 0.0 {
            quantity as f64 * estimated_price
        } else {
            0.0
        };
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            estimated_price,
            estimated_value,
            currency: currency.into(),
            reason: reason.into(),
        }
    }
}

/// Which calculator family produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityCategory {
    ProfitTaking,
    AveragingDown,
    OpportunityBuys,
    RebalanceSells,
    RebalanceBuys,
}

impl OpportunityCategory {
    pub const ALL: [OpportunityCategory; 5] = [
        Self::ProfitTaking,
        Self::AveragingDown,
        Self::OpportunityBuys,
        Self::RebalanceSells,
        Self::RebalanceBuys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfitTaking => "profit_taking",
            Self::AveragingDown => "averaging_down",
            Self::OpportunityBuys => "opportunity_buys",
            Self::RebalanceSells => "rebalance_sells",
            Self::RebalanceBuys => "rebalance_buys",
        }
    }
}

/// A proposed single action with the priority its calculator assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCandidate {
    pub step: HolisticStep,
    pub priority: f64,
    pub category: OpportunityCategory,
    pub tags: Vec<String>,
}

impl ActionCandidate {
    pub fn symbol(&self) -> &str {
        &self.step.symbol
    }

    pub fn side(&self) -> TradeSide {
        self.step.side
    }

    pub fn value(&self) -> f64 {
        self.step.estimated_value
    }
}
