//! Batch controller behavior over pre-seeded search spaces.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rebalancer_core::config::PlannerConfiguration;
use rebalancer_core::domain::{HolisticPlan, HolisticStep, OpportunityContext, PortfolioHash, TradeSide};
use rebalancer_runner::{
    spawn_batch, status, BatchConfig, BatchController, BatchError, BestResult, CancelToken, EvaluationRecord,
    GenerationRecord, InMemoryRepository, JsonlRepository, PlanRepository, PlannerEvent, PlanningStatus,
    RepositoryError, SequenceRecord,
};

// ─── Fixtures ────────────────────────────────────────────────────────

fn snapshot() -> OpportunityContext {
    OpportunityContext {
        available_cash_eur: 10_000.0,
        prices: [("NVDA", 50.0), ("AMD", 40.0), ("BAD", f64::NAN)]
            .into_iter()
            .map(|(s, p)| (s.to_string(), p))
            .collect(),
        target_weights: [("NVDA".to_string(), 0.1)].into_iter().collect(),
        ..Default::default()
    }
}

fn buy(symbol: &str, quantity: u64) -> HolisticPlan {
    HolisticPlan::new(
        vec![HolisticStep::new(symbol, TradeSide::Buy, quantity, 50.0, "EUR", "seed")],
        "seed",
        quantity as f64 / 100.0,
    )
}

/// Store and commit `plans` as the search space of the snapshot's fingerprint.
fn seed(repo: &dyn PlanRepository, plans: Vec<HolisticPlan>) -> PortfolioHash {
    let hash = snapshot().portfolio_hash();
    let records: Vec<SequenceRecord> = plans
        .into_iter()
        .enumerate()
        .map(|(i, p)| SequenceRecord::new(hash.clone(), i, p))
        .collect();
    repo.append_sequences(&records).unwrap();
    repo.commit_generation(&GenerationRecord::new(hash.clone(), records.len()))
        .unwrap();
    hash
}

fn twenty_five() -> Vec<HolisticPlan> {
    (1..=25).map(|q| buy("NVDA", q)).collect()
}

fn batch_of(size: usize) -> BatchConfig {
    BatchConfig {
        batch_size: size,
        chunk_size: 5,
        ..Default::default()
    }
}

/// Delegates to an in-memory store; can fail evaluation writes and cancel a
/// token after the first committed chunk.
#[derive(Default)]
struct Flaky {
    inner: InMemoryRepository,
    fail_evaluations_after: Option<usize>,
    writes: AtomicUsize,
    healthy: AtomicBool,
    cancel_after_write: Option<CancelToken>,
}

impl PlanRepository for Flaky {
    fn append_sequence(&self, record: &SequenceRecord) -> Result<(), RepositoryError> {
        self.inner.append_sequence(record)
    }

    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<(), RepositoryError> {
        self.append_evaluations(std::slice::from_ref(record))
    }

    fn append_evaluations(&self, records: &[EvaluationRecord]) -> Result<(), RepositoryError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_evaluations_after {
            if n >= limit && !self.healthy.load(Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable("disk full".into()));
            }
        }
        self.inner.append_evaluations(records)?;
        if let Some(token) = &self.cancel_after_write {
            token.cancel();
        }
        Ok(())
    }

    fn upsert_best_result(&self, best: &BestResult) -> Result<(), RepositoryError> {
        self.inner.upsert_best_result(best)
    }

    fn commit_generation(&self, generation: &GenerationRecord) -> Result<(), RepositoryError> {
        self.inner.commit_generation(generation)
    }

    fn get_generation(&self, hash: &PortfolioHash) -> Result<Option<GenerationRecord>, RepositoryError> {
        self.inner.get_generation(hash)
    }

    fn reset(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        self.inner.reset(hash)
    }

    fn try_claim(&self, hash: &PortfolioHash) -> Result<bool, RepositoryError> {
        self.inner.try_claim(hash)
    }

    fn release_claim(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        self.inner.release_claim(hash)
    }

    fn count_sequences(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        self.inner.count_sequences(hash)
    }

    fn count_evaluations(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        self.inner.count_evaluations(hash)
    }

    fn get_best_result(&self, hash: &PortfolioHash) -> Result<Option<BestResult>, RepositoryError> {
        self.inner.get_best_result(hash)
    }

    fn list_sequences(&self, hash: &PortfolioHash) -> Result<Vec<SequenceRecord>, RepositoryError> {
        self.inner.list_sequences(hash)
    }

    fn list_evaluations(&self, hash: &PortfolioHash) -> Result<Vec<EvaluationRecord>, RepositoryError> {
        self.inner.list_evaluations(hash)
    }
}

// ─── Resume ──────────────────────────────────────────────────────────

#[test]
fn twenty_five_sequences_resume_in_batches_of_ten() {
    let repo = Arc::new(InMemoryRepository::new());
    let hash = seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo.clone());
    let cfg = PlannerConfiguration::default();

    let mut seen = Vec::new();
    let mut best = f64::NEG_INFINITY;
    loop {
        let r = controller
            .generate_batch(&snapshot(), &cfg, &batch_of(10), &CancelToken::new())
            .unwrap();
        assert_eq!(r.sequences_total, 25);
        assert!(r.sequences_evaluated <= r.sequences_total);
        let score = r.best_score.expect("a feasible plan was scored");
        assert!(score >= best, "best score decreased: {score} < {best}");
        best = score;
        seen.push((r.sequences_evaluated, r.complete));
        if r.complete {
            break;
        }
    }

    assert_eq!(seen, vec![(10, false), (20, false), (25, true)]);
    let report = status(repo.as_ref(), &hash).unwrap();
    assert_eq!(report.status, PlanningStatus::Complete);
    assert_eq!(report.sequences_evaluated, 25);
    assert_eq!(report.best_score, Some(best));
}

#[test]
fn resume_works_across_jsonl_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PlannerConfiguration::default();
    {
        let repo = Arc::new(JsonlRepository::new(dir.path()));
        seed(repo.as_ref(), twenty_five());
        let r = BatchController::new(repo)
            .generate_batch(&snapshot(), &cfg, &batch_of(10), &CancelToken::new())
            .unwrap();
        assert_eq!(r.sequences_evaluated, 10);
    }
    let repo = Arc::new(JsonlRepository::new(dir.path()));
    let r = BatchController::new(repo)
        .generate_batch(&snapshot(), &cfg, &batch_of(100), &CancelToken::new())
        .unwrap();
    assert_eq!(r.sequences_evaluated, 25);
    assert_eq!(r.evaluated_this_call, 15);
    assert!(r.complete);
}

#[test]
fn completed_search_does_no_further_work() {
    let repo = Arc::new(InMemoryRepository::new());
    seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo);
    let cfg = PlannerConfiguration::default();
    let first = controller
        .generate_batch(&snapshot(), &cfg, &batch_of(100), &CancelToken::new())
        .unwrap();
    let again = controller
        .generate_batch(&snapshot(), &cfg, &batch_of(100), &CancelToken::new())
        .unwrap();
    assert!(first.complete && again.complete);
    assert_eq!(again.evaluated_this_call, 0);
    assert_eq!(again.best_score, first.best_score);
}

// ─── Failures ────────────────────────────────────────────────────────

#[test]
fn evaluation_error_is_recorded_and_dropped() {
    let repo = Arc::new(InMemoryRepository::new());
    let hash = seed(repo.as_ref(), vec![buy("NVDA", 2), buy("BAD", 1), buy("AMD", 3)]);
    let r = BatchController::new(repo.clone())
        .generate_batch(&snapshot(), &PlannerConfiguration::default(), &batch_of(10), &CancelToken::new())
        .unwrap();

    assert!(r.complete);
    assert_eq!(r.sequences_evaluated, 3);
    assert_eq!(r.failed_this_call, 1);

    let evaluations = repo.list_evaluations(&hash).unwrap();
    let bad = evaluations.iter().find(|e| e.index == 1).unwrap();
    assert!(bad.score.is_none());
    assert!(bad.error.is_some());
    let best = repo.get_best_result(&hash).unwrap().unwrap();
    assert!(best.frontier.iter().all(|p| !p.touches("BAD")));
}

#[test]
fn persistence_error_keeps_committed_chunks() {
    let repo = Arc::new(Flaky {
        fail_evaluations_after: Some(1),
        ..Default::default()
    });
    let hash = seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo.clone());
    let sub = controller.events().subscribe();

    let err = controller
        .generate_batch(&snapshot(), &PlannerConfiguration::default(), &batch_of(25), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BatchError::Repository(RepositoryError::Unavailable(_))));
    assert!(matches!(sub.drain().last(), Some(PlannerEvent::BatchFailed { .. })));

    // The first chunk is committed and the fingerprint is free again.
    assert_eq!(repo.count_evaluations(&hash).unwrap(), 5);
    assert!(repo.get_best_result(&hash).unwrap().is_some());
    assert!(!controller.registry().is_running(&hash));

    repo.healthy.store(true, Ordering::SeqCst);
    let r = controller
        .generate_batch(&snapshot(), &PlannerConfiguration::default(), &batch_of(25), &CancelToken::new())
        .unwrap();
    assert_eq!(r.evaluated_this_call, 20);
    assert!(r.complete);
}

// ─── Concurrency and cancellation ────────────────────────────────────

#[test]
fn second_run_for_the_same_fingerprint_is_rejected() {
    let repo = Arc::new(InMemoryRepository::new());
    let hash = seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo);
    let _held = controller.registry().try_acquire(&hash).unwrap();

    let err = controller
        .generate_batch(&snapshot(), &PlannerConfiguration::default(), &batch_of(10), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BatchError::AlreadyRunning(ref h) if *h == hash));

    let spawned = spawn_batch(
        controller.clone(),
        snapshot(),
        PlannerConfiguration::default(),
        batch_of(10),
        CancelToken::new(),
    );
    assert!(matches!(spawned, Err(BatchError::AlreadyRunning(_))));
}

#[test]
fn lock_file_from_another_process_blocks_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(JsonlRepository::new(dir.path()));
    let hash = seed(repo.as_ref(), twenty_five());
    assert!(JsonlRepository::new(dir.path()).try_claim(&hash).unwrap());

    let controller = BatchController::new(repo.clone());
    let spawned = spawn_batch(
        controller.clone(),
        snapshot(),
        PlannerConfiguration::default(),
        batch_of(5),
        CancelToken::new(),
    );
    assert!(matches!(spawned, Err(BatchError::AlreadyRunning(ref h)) if *h == hash));
    assert!(!controller.registry().is_running(&hash));
    assert_eq!(repo.count_evaluations(&hash).unwrap(), 0);

    // Clearing a stale lock by hand frees the fingerprint.
    std::fs::remove_file(repo.lock_path(&hash)).unwrap();
    let r = spawn_batch(
        controller,
        snapshot(),
        PlannerConfiguration::default(),
        batch_of(5),
        CancelToken::new(),
    )
    .unwrap()
    .join()
    .unwrap();
    assert_eq!(r.sequences_evaluated, 5);
    assert!(!repo.lock_path(&hash).exists());
}

#[test]
fn cancellation_flushes_the_completed_chunk() {
    let token = CancelToken::new();
    let repo = Arc::new(Flaky {
        cancel_after_write: Some(token.clone()),
        ..Default::default()
    });
    let hash = seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo.clone());

    let r = controller
        .generate_batch(&snapshot(), &PlannerConfiguration::default(), &batch_of(25), &token)
        .unwrap();
    assert!(r.cancelled);
    assert!(!r.complete);
    assert_eq!(r.sequences_evaluated, 5);
    assert_eq!(repo.count_evaluations(&hash).unwrap(), 5);
    assert_eq!(
        status(repo.as_ref(), &hash).unwrap().status,
        PlanningStatus::Evaluating
    );
}

#[test]
fn background_task_reports_through_its_handle() {
    let repo = Arc::new(InMemoryRepository::new());
    let hash = seed(repo.as_ref(), twenty_five());
    let controller = BatchController::new(repo);
    let sub = controller.events().subscribe_with_capacity(128);

    let handle = spawn_batch(
        controller.clone(),
        snapshot(),
        PlannerConfiguration::default(),
        batch_of(25),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(handle.job_id(), &hash);

    let r = handle.join().unwrap();
    assert!(r.complete);
    assert!(!controller.registry().is_running(&hash));

    let events = sub.drain();
    let chunks = events
        .iter()
        .filter(|e| matches!(e, PlannerEvent::ChunkEvaluated { .. }))
        .count();
    assert_eq!(chunks, 5);
}
