//! Plan execution through an external trade executor.
//!
//! The planner never places orders itself. [`execute_plan`] hands each step to a
//! [`TradeExecutor`] in order and reports the outcome per step; a failed step
//! does not stop the remaining ones.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use rebalancer_core::domain::HolisticStep;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("invalid step: {0}")]
    InvalidStep(String),

    #[error("step index {index} out of range (plan has {len} steps)")]
    StepOutOfRange { index: usize, len: usize },
}

/// Broker-side confirmation of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub order_id: String,
    pub filled_quantity: u64,
    pub fill_price: Option<f64>,
}

/// Places one trade. Implemented by broker adapters.
pub trait TradeExecutor: Send + Sync {
    fn execute(&self, step: &HolisticStep) -> Result<ExecutionReceipt, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step: HolisticStep,
    pub receipt: Option<ExecutionReceipt>,
    /// Failure reason; `None` on success.
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<StepOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl ExecutionReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

fn run_step(index: usize, step: &HolisticStep, executor: &dyn TradeExecutor) -> StepOutcome {
    let result = if step.quantity == 0 {
        Err(ExecutionError::InvalidStep(format!("zero quantity for {}", step.symbol)))
    } else {
        executor.execute(step)
    };
    match result {
        Ok(receipt) => StepOutcome {
            index,
            step: step.clone(),
            receipt: Some(receipt),
            error: None,
        },
        Err(e) => {
            warn!(index, symbol = %step.symbol, side = %step.side, error = %e, "step failed");
            StepOutcome {
                index,
                step: step.clone(),
                receipt: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Execute one step of a plan by index.
pub fn execute_step(
    steps: &[HolisticStep],
    index: usize,
    executor: &dyn TradeExecutor,
) -> Result<StepOutcome, ExecutionError> {
    let step = steps.get(index).ok_or(ExecutionError::StepOutOfRange {
        index,
        len: steps.len(),
    })?;
    Ok(run_step(index, step, executor))
}

/// Execute every step in order, continuing past failures.
pub fn execute_plan(steps: &[HolisticStep], executor: &dyn TradeExecutor) -> ExecutionReport {
    let mut report = ExecutionReport::default();
    for (index, step) in steps.iter().enumerate() {
        let outcome = run_step(index, step, executor);
        if outcome.succeeded() {
            report.succeeded += 1;
        } else {
            report.failed += 1;
        }
        report.outcomes.push(outcome);
    }
    info!(
        steps = steps.len(),
        succeeded = report.succeeded,
        failed = report.failed,
        "plan executed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebalancer_core::domain::TradeSide;
    use std::sync::Mutex;

    /// Rejects one symbol, fills everything else.
    struct Broker {
        reject: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl TradeExecutor for Broker {
        fn execute(&self, step: &HolisticStep) -> Result<ExecutionReceipt, ExecutionError> {
            self.seen.lock().unwrap().push(step.symbol.clone());
            if step.symbol == self.reject {
                return Err(ExecutionError::Rejected("market closed".into()));
            }
            Ok(ExecutionReceipt {
                order_id: format!("ord-{}", step.symbol),
                filled_quantity: step.quantity,
                fill_price: Some(step.estimated_price),
            })
        }
    }

    fn broker(reject: &'static str) -> Broker {
        Broker {
            reject,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn steps() -> Vec<HolisticStep> {
        vec![
            HolisticStep::new("AAPL", TradeSide::Sell, 5, 150.0, "EUR", "trim"),
            HolisticStep::new("NVDA", TradeSide::Buy, 10, 50.0, "EUR", "add"),
            HolisticStep::new("AMD", TradeSide::Buy, 3, 40.0, "EUR", "add"),
        ]
    }

    #[test]
    fn failure_does_not_abort_remaining_steps() {
        let b = broker("NVDA");
        let report = execute_plan(&steps(), &b);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.all_succeeded());
        assert_eq!(*b.seen.lock().unwrap(), vec!["AAPL", "NVDA", "AMD"]);
        assert_eq!(report.outcomes[1].error.as_deref(), Some("order rejected: market closed"));
        assert!(report.outcomes[2].succeeded());
    }

    #[test]
    fn zero_quantity_never_reaches_the_executor() {
        let b = broker("");
        let step = HolisticStep::new("SAP", TradeSide::Buy, 0, 100.0, "EUR", "noop");
        let report = execute_plan(&[step], &b);
        assert_eq!(report.failed, 1);
        assert!(b.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn out_of_range_step_is_an_error() {
        let err = execute_step(&steps(), 3, &broker("")).unwrap_err();
        assert_eq!(err, ExecutionError::StepOutOfRange { index: 3, len: 3 });
        assert!(execute_step(&steps(), 0, &broker("")).unwrap().succeeded());
    }
}
