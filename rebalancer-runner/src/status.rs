//! Planning status derived from repository counts.

use std::fmt;

use serde::{Deserialize, Serialize};

use rebalancer_core::domain::PortfolioHash;

use crate::repository::{PlanRepository, RepositoryError};

/// Lifecycle of a fingerprint's search. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    /// No sequences yet.
    Idle,
    /// Sequences exist, none evaluated, or the set is not committed yet.
    Generating,
    Evaluating,
    Complete,
}

impl PlanningStatus {
    pub fn from_counts(total: usize, evaluated: usize) -> Self {
        if total == 0 {
            Self::Idle
        } else if evaluated == 0 {
            Self::Generating
        } else if evaluated < total {
            Self::Evaluating
        } else {
            Self::Complete
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Evaluating => "evaluating",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for PlanningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `evaluated / total`, 0 when nothing was generated.
pub fn progress(total: usize, evaluated: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        evaluated as f64 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub portfolio_hash: PortfolioHash,
    pub status: PlanningStatus,
    pub sequences_total: usize,
    pub sequences_evaluated: usize,
    pub progress: f64,
    pub best_score: Option<f64>,
}

/// Current status of the search for `hash`.
///
/// The total comes from the generation marker once committed; before that the
/// stored sequences are counted and the search is still generating.
pub fn status(repo: &dyn PlanRepository, hash: &PortfolioHash) -> Result<StatusReport, RepositoryError> {
    let generation = repo.get_generation(hash)?;
    let total = match &generation {
        Some(g) => g.sequences_total,
        None => repo.count_sequences(hash)?,
    };
    let evaluated = repo.count_evaluations(hash)?;
    let best_score = repo.get_best_result(hash)?.map(|b| b.score);
    let status = match generation {
        None if total > 0 => PlanningStatus::Generating,
        _ => PlanningStatus::from_counts(total, evaluated),
    };
    Ok(StatusReport {
        portfolio_hash: hash.clone(),
        status,
        sequences_total: total,
        sequences_evaluated: evaluated,
        progress: progress(total, evaluated),
        best_score,
    })
}
