//! Progress events with drop-on-full fan-out.
//!
//! The broadcaster never blocks its caller: every subscriber has a bounded
//! queue and an event that does not fit is dropped and counted. Disconnected
//! subscribers are removed on the next publish. [`EventBroadcaster::shutdown`]
//! stops accepting events and closes every queue; subscribers still receive
//! what was already queued and then see the end of the stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use rebalancer_core::domain::PortfolioHash;

/// Default per-subscriber queue length.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlannerEvent {
    BatchStarted {
        portfolio_hash: PortfolioHash,
        total: usize,
        evaluated: usize,
    },
    SequencesGenerated {
        portfolio_hash: PortfolioHash,
        count: usize,
    },
    ChunkEvaluated {
        portfolio_hash: PortfolioHash,
        evaluated: usize,
        total: usize,
        best_score: Option<f64>,
    },
    BatchCompleted {
        portfolio_hash: PortfolioHash,
        evaluated: usize,
        total: usize,
        complete: bool,
        cancelled: bool,
    },
    BatchFailed {
        portfolio_hash: PortfolioHash,
        error: String,
    },
}

#[derive(Debug, Default)]
struct Shared {
    subscribers: Mutex<Vec<SyncSender<PlannerEvent>>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Cloneable handle; all clones publish to the same subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    /// Register a subscriber with a queue of `capacity` events (at least 1).
    ///
    /// After shutdown the returned subscription is already closed.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        if !self.shared.closed.load(Ordering::Acquire) {
            if let Ok(mut subs) = self.shared.subscribers.lock() {
                subs.push(tx);
            }
        }
        Subscription { rx }
    }

    /// Deliver `event` to every subscriber that has room. Never blocks.
    pub fn publish(&self, event: PlannerEvent) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut subs) = self.shared.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().map_or(0, |s| s.len())
    }

    /// Events dropped so far because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events and close every subscriber queue.
    ///
    /// Returns the number of events dropped over the broadcaster's lifetime.
    pub fn shutdown(&self) -> u64 {
        self.shared.closed.store(true, Ordering::Release);
        if let Ok(mut subs) = self.shared.subscribers.lock() {
            subs.clear();
        }
        let dropped = self.dropped();
        debug!(dropped, "event broadcaster shut down");
        dropped
    }
}

/// Receiving end of one subscriber queue.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<PlannerEvent>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<PlannerEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout`. Errors once the broadcaster has shut down and the
    /// queue is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<PlannerEvent>, RecvError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RecvError),
        }
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<PlannerEvent> {
        self.rx.try_iter().collect()
    }

    /// Block until the broadcaster shuts down, yielding every event.
    pub fn events(self) -> impl Iterator<Item = PlannerEvent> {
        self.rx.into_iter()
    }
}
