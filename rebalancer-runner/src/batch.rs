//! Resumable batch controller.
//!
//! One call to [`BatchController::generate_batch`] evaluates at most
//! `batch_size` stored sequences for a portfolio fingerprint:
//!
//! 1. On the first call the candidate pool is generated, expanded into
//!    sequences and every sequence is stored, followed by a generation marker
//!    holding the total. Sequences without a marker are a fragment of an
//!    interrupted generation and are regenerated.
//! 2. Sequences without an evaluation record are scored in chunks of
//!    `chunk_size`, optionally in parallel within a chunk.
//! 3. After each chunk the frontier is reselected from the stored frontier plus
//!    the newly scored plans. With `save_progress` the chunk's evaluations and
//!    the best result are committed right away, otherwise once at the end.
//!
//! A later call with the same fingerprint picks up where the repository left
//! off. The best score stored for a fingerprint never decreases. Each run
//! claims its fingerprint in the repository, so controllers in other threads
//! or processes sharing the store cannot run it at the same time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use rebalancer_core::config::{ConfigError, PlannerConfiguration, PlanningContext, SelectionPolicy};
use rebalancer_core::domain::{EvaluationContext, HolisticPlan, OpportunityContext, PortfolioHash};
use rebalancer_core::evaluator::{EvaluationError, Evaluator};
use rebalancer_core::generator::{expand_sequences, generate_candidates};
use rebalancer_core::selector::select_frontier;

use crate::events::{EventBroadcaster, PlannerEvent};
use crate::registry::{JobGuard, JobRegistry};
use crate::repository::{
    BestResult, EvaluationRecord, GenerationRecord, PlanRepository, RepositoryError, SequenceRecord,
};
use crate::task::CancelToken;

// ─── Configuration ───────────────────────────────────────────────────

/// How much work one call does and when it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Maximum number of sequences evaluated per call.
    pub batch_size: usize,
    /// Commit evaluations and the best result after every chunk.
    pub save_progress: bool,
    pub chunk_size: usize,
    /// Evaluate the plans of a chunk on the rayon pool.
    pub parallel: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            save_progress: true,
            chunk_size: 10,
            parallel: false,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.batch_size == 0 {
            return Err(BatchError::InvalidBatchConfig {
                field: "batch_size",
                value: self.batch_size,
            });
        }
        if self.chunk_size == 0 {
            return Err(BatchError::InvalidBatchConfig {
                field: "chunk_size",
                value: self.chunk_size,
            });
        }
        Ok(())
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid planner configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid batch configuration: {field} = {value}")]
    InvalidBatchConfig { field: &'static str, value: usize },

    #[error("a batch for portfolio {0} is already running")]
    AlreadyRunning(PortfolioHash),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("stored sequences for portfolio {portfolio_hash} do not match their generation: expected {expected}, found {found}")]
    SequenceSetMismatch {
        portfolio_hash: PortfolioHash,
        expected: usize,
        found: usize,
    },

    #[error("failed to start batch worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("batch worker panicked")]
    WorkerPanicked,
}

// ─── Result ──────────────────────────────────────────────────────────

/// Outcome of one batch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub portfolio_hash: PortfolioHash,
    pub sequences_total: usize,
    /// Evaluated so far, across every call for this fingerprint.
    pub sequences_evaluated: usize,
    /// Evaluated by this call, failures included.
    pub evaluated_this_call: usize,
    /// Plans whose evaluation failed in this call.
    pub failed_this_call: usize,
    pub best_score: Option<f64>,
    pub best_plan: Option<HolisticPlan>,
    pub complete: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl BatchResult {
    pub fn progress(&self) -> f64 {
        crate::status::progress(self.sequences_total, self.sequences_evaluated)
    }
}

// ─── Controller ──────────────────────────────────────────────────────

/// Drives generation, evaluation and selection over a [`PlanRepository`].
///
/// Cheap to clone: the repository, registry and broadcaster are shared.
#[derive(Clone)]
pub struct BatchController {
    repo: Arc<dyn PlanRepository>,
    registry: JobRegistry,
    events: EventBroadcaster,
}

impl std::fmt::Debug for BatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchController")
            .field("registry", &self.registry)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Best plan and frontier carried across chunks.
struct Progress {
    best: Option<(HolisticPlan, f64)>,
    frontier: Vec<HolisticPlan>,
    dirty: bool,
}

impl Progress {
    fn from_stored(stored: Option<BestResult>) -> Self {
        match stored {
            Some(b) => Self {
                best: Some((b.plan, b.score)),
                frontier: b.frontier,
                dirty: false,
            },
            None => Self {
                best: None,
                frontier: Vec::new(),
                dirty: false,
            },
        }
    }

    fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|(_, s)| *s)
    }

    /// Fold newly scored plans into the frontier; the best only moves up.
    fn absorb(&mut self, scored: Vec<HolisticPlan>, policy: &SelectionPolicy) {
        if scored.is_empty() {
            return;
        }
        let mut pool = std::mem::take(&mut self.frontier);
        pool.extend(scored);
        self.frontier = select_frontier(&pool, policy);
        self.dirty = true;

        if let Some(top) = self.frontier.first() {
            if let Some(score) = top.rank_score() {
                if self.best_score().map_or(true, |current| score > current) {
                    self.best = Some((top.clone(), score));
                }
            }
        }
    }

    fn checkpoint(&self, hash: &PortfolioHash) -> Option<BestResult> {
        self.best.as_ref().map(|(plan, score)| BestResult {
            portfolio_hash: hash.clone(),
            plan: plan.clone(),
            score: *score,
            frontier: self.frontier.clone(),
            updated_at: Utc::now(),
        })
    }
}

impl BatchController {
    pub fn new(repo: Arc<dyn PlanRepository>) -> Self {
        Self {
            repo,
            registry: JobRegistry::new(),
            events: EventBroadcaster::new(),
        }
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_events(mut self, events: EventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn repository(&self) -> &Arc<dyn PlanRepository> {
        &self.repo
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Run one batch for the snapshot's fingerprint on the calling thread.
    pub fn generate_batch(
        &self,
        ctx: &OpportunityContext,
        cfg: &PlannerConfiguration,
        batch_cfg: &BatchConfig,
        cancel: &CancelToken,
    ) -> Result<BatchResult, BatchError> {
        let guard = self.prepare(ctx, cfg, batch_cfg)?;
        self.run(&guard, ctx, cfg, batch_cfg, cancel)
    }

    /// Validate both configurations and claim the fingerprint, locally and in
    /// the repository.
    pub(crate) fn prepare(
        &self,
        ctx: &OpportunityContext,
        cfg: &PlannerConfiguration,
        batch_cfg: &BatchConfig,
    ) -> Result<JobGuard, BatchError> {
        cfg.validate()?;
        batch_cfg.validate()?;
        let hash = ctx.portfolio_hash();
        self.registry
            .try_acquire_in(&hash, &self.repo)?
            .ok_or(BatchError::AlreadyRunning(hash))
    }

    pub(crate) fn run(
        &self,
        guard: &JobGuard,
        ctx: &OpportunityContext,
        cfg: &PlannerConfiguration,
        batch_cfg: &BatchConfig,
        cancel: &CancelToken,
    ) -> Result<BatchResult, BatchError> {
        let hash = guard.portfolio_hash();
        let result = self.run_inner(hash, ctx, cfg, batch_cfg, cancel);
        if let Err(e) = &result {
            warn!(portfolio = hash.short(), error = %e, "batch failed");
            self.events.publish(PlannerEvent::BatchFailed {
                portfolio_hash: hash.clone(),
                error: e.to_string(),
            });
        }
        result
    }

    fn run_inner(
        &self,
        hash: &PortfolioHash,
        ctx: &OpportunityContext,
        cfg: &PlannerConfiguration,
        batch_cfg: &BatchConfig,
        cancel: &CancelToken,
    ) -> Result<BatchResult, BatchError> {
        let start = Instant::now();
        let snapshot = cfg.constrain(ctx);
        let planning = PlanningContext::from_config(cfg);

        let sequences = self.load_or_generate(hash, &snapshot, cfg)?;
        let total = sequences.len();
        let done: BTreeSet<usize> = self
            .repo
            .list_evaluations(hash)?
            .into_iter()
            .map(|e| e.index)
            .collect();
        let mut evaluated = sequences.iter().filter(|s| done.contains(&s.index)).count();

        info!(
            portfolio = hash.short(),
            total,
            evaluated,
            batch_size = batch_cfg.batch_size,
            "batch started"
        );
        self.events.publish(PlannerEvent::BatchStarted {
            portfolio_hash: hash.clone(),
            total,
            evaluated,
        });

        let pending: Vec<&SequenceRecord> = sequences
            .iter()
            .filter(|s| !done.contains(&s.index))
            .take(batch_cfg.batch_size)
            .collect();

        let evaluator = Evaluator::new(planning.evaluation_mode.clone());
        let eval = EvaluationContext::new(&snapshot);
        let mut progress = Progress::from_stored(self.repo.get_best_result(hash)?);
        let mut unsaved: Vec<EvaluationRecord> = Vec::new();
        let mut evaluated_this_call = 0;
        let mut failed_this_call = 0;
        let mut cancelled = false;

        for chunk in pending.chunks(batch_cfg.chunk_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let outcomes = evaluate_chunk(chunk, &evaluator, &eval, batch_cfg.parallel, cancel);
            cancelled = outcomes.len() < chunk.len();

            let mut records = Vec::with_capacity(outcomes.len());
            let mut scored = Vec::new();
            for (record, outcome) in chunk.iter().zip(outcomes) {
                records.push(evaluation_record(record, &outcome));
                match outcome {
                    Ok(plan) => scored.push(plan),
                    Err(e) => {
                        warn!(index = record.index, origin = %record.pattern, error = %e, "sequence dropped after evaluation error");
                        failed_this_call += 1;
                    }
                }
            }
            evaluated += records.len();
            evaluated_this_call += records.len();
            progress.absorb(scored, &planning.selection);

            if batch_cfg.save_progress {
                self.commit(hash, &records, &mut progress)?;
            } else {
                unsaved.extend(records);
            }

            debug!(portfolio = hash.short(), evaluated, total, "chunk evaluated");
            self.events.publish(PlannerEvent::ChunkEvaluated {
                portfolio_hash: hash.clone(),
                evaluated,
                total,
                best_score: progress.best_score(),
            });

            if cancelled {
                break;
            }
        }

        if !batch_cfg.save_progress {
            self.commit(hash, &unsaved, &mut progress)?;
        }

        let complete = evaluated >= total;
        info!(
            portfolio = hash.short(),
            evaluated,
            total,
            evaluated_this_call,
            failed_this_call,
            complete,
            cancelled,
            best_score = ?progress.best_score(),
            "batch finished"
        );
        self.events.publish(PlannerEvent::BatchCompleted {
            portfolio_hash: hash.clone(),
            evaluated,
            total,
            complete,
            cancelled,
        });

        Ok(BatchResult {
            portfolio_hash: hash.clone(),
            sequences_total: total,
            sequences_evaluated: evaluated,
            evaluated_this_call,
            failed_this_call,
            best_score: progress.best_score(),
            best_plan: progress.best.map(|(plan, _)| plan),
            complete,
            cancelled,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Committed sequences for `hash`, generating and committing them when
    /// there is no generation marker yet.
    fn load_or_generate(
        &self,
        hash: &PortfolioHash,
        snapshot: &OpportunityContext,
        cfg: &PlannerConfiguration,
    ) -> Result<Vec<SequenceRecord>, BatchError> {
        let stored = self.repo.list_sequences(hash)?;
        match self.repo.get_generation(hash)? {
            Some(generation) if generation.sequences_total == stored.len() => return Ok(stored),
            Some(generation) => {
                return Err(BatchError::SequenceSetMismatch {
                    portfolio_hash: hash.clone(),
                    expected: generation.sequences_total,
                    found: stored.len(),
                })
            }
            None if !stored.is_empty() => {
                warn!(
                    portfolio = hash.short(),
                    stored = stored.len(),
                    "discarding sequences of an unfinished generation"
                );
                self.repo.reset(hash)?;
            }
            None => {}
        }

        let set = generate_candidates(snapshot, cfg);
        let expansion = expand_sequences(&set, snapshot, cfg);
        let records: Vec<SequenceRecord> = expansion
            .plans
            .into_iter()
            .enumerate()
            .map(|(i, plan)| SequenceRecord::new(hash.clone(), i, plan))
            .collect();
        self.repo.append_sequences(&records)?;
        self.repo
            .commit_generation(&GenerationRecord::new(hash.clone(), records.len()))?;

        info!(
            portfolio = hash.short(),
            candidates = set.candidates.len(),
            sequences = records.len(),
            "sequences generated"
        );
        self.events.publish(PlannerEvent::SequencesGenerated {
            portfolio_hash: hash.clone(),
            count: records.len(),
        });
        Ok(records)
    }

    /// Append `records`, then replace the best result if anything changed.
    fn commit(
        &self,
        hash: &PortfolioHash,
        records: &[EvaluationRecord],
        progress: &mut Progress,
    ) -> Result<(), BatchError> {
        if !records.is_empty() {
            self.repo.append_evaluations(records)?;
        }
        if progress.dirty {
            if let Some(best) = progress.checkpoint(hash) {
                self.repo.upsert_best_result(&best)?;
            }
            progress.dirty = false;
        }
        Ok(())
    }
}

type Outcome = Result<HolisticPlan, EvaluationError>;

/// Score every plan of a chunk, in chunk order.
///
/// Sequential evaluation stops at the first plan after cancellation, so the
/// returned list may be shorter than the chunk. Parallel evaluation always
/// finishes the chunk.
fn evaluate_chunk(
    chunk: &[&SequenceRecord],
    evaluator: &Evaluator,
    eval: &EvaluationContext<'_>,
    parallel: bool,
    cancel: &CancelToken,
) -> Vec<Outcome> {
    if parallel {
        return chunk
            .par_iter()
            .map(|record| evaluator.score_plan(&record.plan, eval))
            .collect();
    }
    let mut outcomes = Vec::with_capacity(chunk.len());
    for record in chunk {
        if cancel.is_cancelled() {
            break;
        }
        outcomes.push(evaluator.score_plan(&record.plan, eval));
    }
    outcomes
}

fn evaluation_record(record: &SequenceRecord, outcome: &Outcome) -> EvaluationRecord {
    let (score, feasible, error) = match outcome {
        Ok(plan) => (plan.score, plan.feasible, None),
        Err(e) => (None, false, Some(e.to_string())),
    };
    EvaluationRecord {
        portfolio_hash: record.portfolio_hash.clone(),
        sequence_hash: record.sequence_hash.clone(),
        index: record.index,
        score,
        feasible,
        error,
        evaluated_at: Utc::now(),
    }
}
