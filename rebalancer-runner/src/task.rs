//! Background batch task: cancellation token, named worker thread, result channel.
//!
//! [`spawn_batch`] validates the request and claims the fingerprint slot on the
//! caller's thread, so a bad configuration or a duplicate run is reported
//! immediately. The batch itself runs on a dedicated thread; the caller keeps a
//! [`BatchHandle`] to cancel it or wait for its result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use rebalancer_core::config::PlannerConfiguration;
use rebalancer_core::domain::{OpportunityContext, PortfolioHash};

use crate::batch::{BatchConfig, BatchController, BatchError, BatchResult};

// ─── Cancellation ────────────────────────────────────────────────────

/// Cooperative cancellation: an explicit flag plus an optional deadline.
///
/// Clones share the flag, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Owner's view of a running batch.
#[derive(Debug)]
pub struct BatchHandle {
    job_id: PortfolioHash,
    cancel: CancelToken,
    rx: Receiver<Result<BatchResult, BatchError>>,
    thread: Option<JoinHandle<()>>,
}

impl BatchHandle {
    /// The portfolio fingerprint the batch runs for.
    pub fn job_id(&self) -> &PortfolioHash {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The result if the batch has finished; `None` while it is still running.
    pub fn try_result(&mut self) -> Option<Result<BatchResult, BatchError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.reap())),
        }
    }

    /// Block until the batch finishes.
    pub fn join(mut self) -> Result<BatchResult, BatchError> {
        match self.rx.recv() {
            Ok(result) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                result
            }
            Err(_) => Err(self.reap()),
        }
    }

    /// The worker dropped its sender without a result: it panicked.
    fn reap(&mut self) -> BatchError {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        warn!(portfolio = self.job_id.short(), "batch worker exited without a result");
        BatchError::WorkerPanicked
    }
}

/// Start a batch on a named background thread.
///
/// Configuration errors and [`BatchError::AlreadyRunning`] are returned here,
/// before any thread is started.
pub fn spawn_batch(
    controller: BatchController,
    ctx: OpportunityContext,
    cfg: PlannerConfiguration,
    batch_cfg: BatchConfig,
    cancel: CancelToken,
) -> Result<BatchHandle, BatchError> {
    let guard = controller.prepare(&ctx, &cfg, &batch_cfg)?;
    let job_id = guard.portfolio_hash().clone();
    let (tx, rx) = mpsc::channel();
    let worker_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name(format!("rebalancer-batch-{}", job_id.short()))
        .spawn(move || {
            let result = controller.run(&guard, &ctx, &cfg, &batch_cfg, &worker_cancel);
            drop(guard);
            if tx.send(result).is_err() {
                debug!("batch handle dropped before the result arrived");
            }
        })
        .map_err(BatchError::Spawn)?;

    Ok(BatchHandle {
        job_id,
        cancel,
        rx,
        thread: Some(thread),
    })
}
