//! In-flight batch runs, keyed by portfolio fingerprint.
//!
//! At most one run per fingerprint holds a slot at a time. The slot is released
//! when the [`JobGuard`] is dropped, including on early return or panic.
//!
//! A registry only sees its own process. [`JobRegistry::try_acquire_in`] also
//! claims the fingerprint in the repository, which every controller and
//! process sharing the store observes.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use rebalancer_core::domain::PortfolioHash;

use crate::repository::{PlanRepository, RepositoryError};

/// Shared set of running fingerprints. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    running: Arc<Mutex<BTreeSet<PortfolioHash>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `hash`; `None` if a run for it is already in flight.
    pub fn try_acquire(&self, hash: &PortfolioHash) -> Option<JobGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(hash.clone()) {
            debug!(portfolio = hash.short(), "batch already running");
            return None;
        }
        Some(JobGuard {
            hash: hash.clone(),
            running: Arc::clone(&self.running),
            claim: None,
        })
    }

    /// Claim the slot for `hash` here and in `repo`; `None` if either is taken.
    pub fn try_acquire_in(
        &self,
        hash: &PortfolioHash,
        repo: &Arc<dyn PlanRepository>,
    ) -> Result<Option<JobGuard>, RepositoryError> {
        let Some(mut guard) = self.try_acquire(hash) else {
            return Ok(None);
        };
        if !repo.try_claim(hash)? {
            debug!(portfolio = hash.short(), "portfolio claimed by another batch");
            return Ok(None);
        }
        guard.claim = Some(Arc::clone(repo));
        Ok(Some(guard))
    }

    pub fn is_running(&self, hash: &PortfolioHash) -> bool {
        self.running
            .lock()
            .map(|r| r.contains(hash))
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<PortfolioHash> {
        self.running
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Holds one fingerprint's slot, and its repository claim if any, until dropped.
pub struct JobGuard {
    hash: PortfolioHash,
    running: Arc<Mutex<BTreeSet<PortfolioHash>>>,
    claim: Option<Arc<dyn PlanRepository>>,
}

impl fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGuard")
            .field("hash", &self.hash)
            .field("claimed", &self.claim.is_some())
            .finish()
    }
}

impl JobGuard {
    pub fn portfolio_hash(&self) -> &PortfolioHash {
        &self.hash
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Some(repo) = self.claim.take() {
            if let Err(e) = repo.release_claim(&self.hash) {
                warn!(portfolio = self.hash.short(), error = %e, "failed to release portfolio claim");
            }
        }
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, JsonlRepository};

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let registry = JobRegistry::new();
        let hash = PortfolioHash::from_bytes(b"p");

        let guard = registry.try_acquire(&hash).unwrap();
        assert!(registry.try_acquire(&hash).is_none());
        assert!(registry.is_running(&hash));

        drop(guard);
        assert!(!registry.is_running(&hash));
        assert!(registry.try_acquire(&hash).is_some());
    }

    #[test]
    fn different_fingerprints_run_side_by_side() {
        let registry = JobRegistry::new();
        let _a = registry.try_acquire(&PortfolioHash::from_bytes(b"a")).unwrap();
        let _b = registry.try_acquire(&PortfolioHash::from_bytes(b"b")).unwrap();
        assert_eq!(registry.running().len(), 2);
    }

    #[test]
    fn clones_share_the_slot_set() {
        let registry = JobRegistry::new();
        let other = registry.clone();
        let hash = PortfolioHash::from_bytes(b"p");
        let _guard = registry.try_acquire(&hash).unwrap();
        assert!(other.try_acquire(&hash).is_none());
    }

    #[test]
    fn slot_is_released_when_the_holder_panics() {
        let registry = JobRegistry::new();
        let hash = PortfolioHash::from_bytes(b"p");
        let r = registry.clone();
        let h = hash.clone();
        let joined = std::thread::spawn(move || {
            let _guard = r.try_acquire(&h).unwrap();
            panic!("boom");
        })
        .join();
        assert!(joined.is_err());
        assert!(!registry.is_running(&hash));
    }

    #[test]
    fn registries_sharing_a_repository_exclude_each_other() {
        let repo: Arc<dyn PlanRepository> = Arc::new(InMemoryRepository::new());
        let (first, second) = (JobRegistry::new(), JobRegistry::new());
        let hash = PortfolioHash::from_bytes(b"p");

        let guard = first.try_acquire_in(&hash, &repo).unwrap().unwrap();
        assert!(second.try_acquire_in(&hash, &repo).unwrap().is_none());
        // The losing registry does not keep its local slot.
        assert!(!second.is_running(&hash));

        drop(guard);
        assert!(second.try_acquire_in(&hash, &repo).unwrap().is_some());
    }

    #[test]
    fn claim_is_released_when_the_holder_panics() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn PlanRepository> = Arc::new(JsonlRepository::new(dir.path()));
        let hash = PortfolioHash::from_bytes(b"p");
        let (r, h) = (Arc::clone(&repo), hash.clone());
        let joined = std::thread::spawn(move || {
            let _guard = JobRegistry::new().try_acquire_in(&h, &r).unwrap().unwrap();
            panic!("boom");
        })
        .join();
        assert!(joined.is_err());
        assert!(!JsonlRepository::new(dir.path()).lock_path(&hash).exists());
        assert!(JobRegistry::new().try_acquire_in(&hash, &repo).unwrap().is_some());
    }
}
