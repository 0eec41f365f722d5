//! Plan repository: generated sequences, evaluations and the best plan per
//! portfolio fingerprint.
//!
//! The repository is the only shared mutable state of a batch run. Everything
//! goes through [`PlanRepository`]; two implementations are provided:
//! - [`InMemoryRepository`]: mutex-guarded maps, for tests and one-shot runs
//! - [`JsonlRepository`]: one directory per fingerprint with `sequences.jsonl`,
//!   an append-only `evaluations.jsonl`, and `generation.json` / `best.json`
//!   checkpoints that are replaced atomically (temp file + rename)
//!
//! A sequence set only counts once its [`GenerationRecord`] is committed. A
//! batch that dies while storing sequences leaves no marker, and the next batch
//! throws the fragment away instead of treating it as the whole search space.
//!
//! [`PlanRepository::try_claim`] guards a fingerprint across every handle on
//! the same store, including other processes for the JSONL store.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use rebalancer_core::domain::{HolisticPlan, PortfolioHash, SequenceHash};

// ─── Records ─────────────────────────────────────────────────────────

/// One generated sequence, numbered in generation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub portfolio_hash: PortfolioHash,
    pub sequence_hash: SequenceHash,
    pub index: usize,
    pub plan: HolisticPlan,
    /// Pattern or generator that produced the plan.
    pub pattern: String,
    pub depth: usize,
    pub priority: f64,
    pub created_at: DateTime<Utc>,
}

impl SequenceRecord {
    pub fn new(portfolio_hash: PortfolioHash, index: usize, plan: HolisticPlan) -> Self {
        Self {
            portfolio_hash,
            sequence_hash: plan.sequence_hash(),
            index,
            pattern: plan.origin.clone(),
            depth: plan.len(),
            priority: plan.priority,
            plan,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of evaluating one stored sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub portfolio_hash: PortfolioHash,
    pub sequence_hash: SequenceHash,
    pub index: usize,
    /// `None` when evaluation failed.
    pub score: Option<f64>,
    pub feasible: bool,
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Commit marker for a fingerprint's sequence set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub portfolio_hash: PortfolioHash,
    pub sequences_total: usize,
    pub created_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn new(portfolio_hash: PortfolioHash, sequences_total: usize) -> Self {
        Self {
            portfolio_hash,
            sequences_total,
            created_at: Utc::now(),
        }
    }
}

/// Best plan found so far for a fingerprint, plus the frontier it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub portfolio_hash: PortfolioHash,
    pub plan: HolisticPlan,
    pub score: f64,
    pub frontier: Vec<HolisticPlan>,
    pub updated_at: DateTime<Utc>,
}

// ─── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("repository lock poisoned")]
    Poisoned,

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ─── Contract ────────────────────────────────────────────────────────

/// Narrow read/write contract used by the batch controller and status reporting.
pub trait PlanRepository: Send + Sync {
    fn append_sequence(&self, record: &SequenceRecord) -> Result<(), RepositoryError>;

    fn append_sequences(&self, records: &[SequenceRecord]) -> Result<(), RepositoryError> {
        records.iter().try_for_each(|r| self.append_sequence(r))
    }

    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<(), RepositoryError>;

    fn append_evaluations(&self, records: &[EvaluationRecord]) -> Result<(), RepositoryError> {
        records.iter().try_for_each(|r| self.append_evaluation(r))
    }

    fn upsert_best_result(&self, best: &BestResult) -> Result<(), RepositoryError>;

    /// Mark the sequences stored for the record's fingerprint as complete.
    fn commit_generation(&self, generation: &GenerationRecord) -> Result<(), RepositoryError>;

    fn get_generation(&self, hash: &PortfolioHash) -> Result<Option<GenerationRecord>, RepositoryError>;

    /// Drop sequences, evaluations, the best result and the generation marker
    /// of `hash`. A claim on `hash` is kept.
    fn reset(&self, hash: &PortfolioHash) -> Result<(), RepositoryError>;

    /// Claim `hash` for one batch run; `Ok(false)` if someone else holds it.
    fn try_claim(&self, hash: &PortfolioHash) -> Result<bool, RepositoryError>;

    fn release_claim(&self, hash: &PortfolioHash) -> Result<(), RepositoryError>;

    fn count_sequences(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError>;

    fn count_evaluations(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError>;

    fn get_best_result(&self, hash: &PortfolioHash) -> Result<Option<BestResult>, RepositoryError>;

    /// Stored sequences in index order.
    fn list_sequences(&self, hash: &PortfolioHash) -> Result<Vec<SequenceRecord>, RepositoryError>;

    fn list_evaluations(&self, hash: &PortfolioHash) -> Result<Vec<EvaluationRecord>, RepositoryError>;
}

// ─── In-memory ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Store {
    sequences: Vec<SequenceRecord>,
    evaluations: Vec<EvaluationRecord>,
    best: Option<BestResult>,
    generation: Option<GenerationRecord>,
    claimed: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    stores: Mutex<BTreeMap<PortfolioHash, Store>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PortfolioHash, Store>>, RepositoryError> {
        self.stores.lock().map_err(|_| RepositoryError::Poisoned)
    }
}

impl PlanRepository for InMemoryRepository {
    fn append_sequence(&self, record: &SequenceRecord) -> Result<(), RepositoryError> {
        let mut stores = self.lock()?;
        let store = stores.entry(record.portfolio_hash.clone()).or_default();
        store.sequences.push(record.clone());
        Ok(())
    }

    fn append_sequences(&self, records: &[SequenceRecord]) -> Result<(), RepositoryError> {
        let mut stores = self.lock()?;
        for record in records {
            let store = stores.entry(record.portfolio_hash.clone()).or_default();
            store.sequences.push(record.clone());
        }
        Ok(())
    }

    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<(), RepositoryError> {
        let mut stores = self.lock()?;
        let store = stores.entry(record.portfolio_hash.clone()).or_default();
        store.evaluations.push(record.clone());
        Ok(())
    }

    fn upsert_best_result(&self, best: &BestResult) -> Result<(), RepositoryError> {
        let mut stores = self.lock()?;
        stores.entry(best.portfolio_hash.clone()).or_default().best = Some(best.clone());
        Ok(())
    }

    fn commit_generation(&self, generation: &GenerationRecord) -> Result<(), RepositoryError> {
        let mut stores = self.lock()?;
        stores.entry(generation.portfolio_hash.clone()).or_default().generation = Some(generation.clone());
        Ok(())
    }

    fn get_generation(&self, hash: &PortfolioHash) -> Result<Option<GenerationRecord>, RepositoryError> {
        Ok(self.lock()?.get(hash).and_then(|s| s.generation.clone()))
    }

    fn reset(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        if let Some(store) = self.lock()?.get_mut(hash) {
            *store = Store {
                claimed: store.claimed,
                ..Store::default()
            };
        }
        Ok(())
    }

    fn try_claim(&self, hash: &PortfolioHash) -> Result<bool, RepositoryError> {
        let mut stores = self.lock()?;
        let store = stores.entry(hash.clone()).or_default();
        if store.claimed {
            return Ok(false);
        }
        store.claimed = true;
        Ok(true)
    }

    fn release_claim(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        if let Some(store) = self.lock()?.get_mut(hash) {
            store.claimed = false;
        }
        Ok(())
    }

    fn count_sequences(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        Ok(self.lock()?.get(hash).map_or(0, |s| s.sequences.len()))
    }

    fn count_evaluations(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        Ok(self.lock()?.get(hash).map_or(0, |s| s.evaluations.len()))
    }

    fn get_best_result(&self, hash: &PortfolioHash) -> Result<Option<BestResult>, RepositoryError> {
        Ok(self.lock()?.get(hash).and_then(|s| s.best.clone()))
    }

    fn list_sequences(&self, hash: &PortfolioHash) -> Result<Vec<SequenceRecord>, RepositoryError> {
        let mut out = self.lock()?.get(hash).map(|s| s.sequences.clone()).unwrap_or_default();
        out.sort_by_key(|r| r.index);
        Ok(out)
    }

    fn list_evaluations(&self, hash: &PortfolioHash) -> Result<Vec<EvaluationRecord>, RepositoryError> {
        Ok(self.lock()?.get(hash).map(|s| s.evaluations.clone()).unwrap_or_default())
    }
}

// ─── JSONL on disk ───────────────────────────────────────────────────

const SEQUENCES_FILE: &str = "sequences.jsonl";
const EVALUATIONS_FILE: &str = "evaluations.jsonl";
const BEST_FILE: &str = "best.json";
const GENERATION_FILE: &str = "generation.json";
const LOCK_FILE: &str = "batch.lock";

/// File-backed repository rooted at one directory.
///
/// Writers are serialized through an internal lock; readers tolerate a
/// truncated or malformed trailing line by skipping it. Claims are lock files
/// created with `create_new`, so they hold across processes. A lock left behind
/// by a crashed process stays until its file is deleted.
#[derive(Debug)]
pub struct JsonlRepository {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all files of one fingerprint.
    pub fn portfolio_dir(&self, hash: &PortfolioHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Lock file present while a batch holds `hash`.
    pub fn lock_path(&self, hash: &PortfolioHash) -> PathBuf {
        self.portfolio_dir(hash).join(LOCK_FILE)
    }

    fn create_dir(&self, hash: &PortfolioHash) -> Result<PathBuf, RepositoryError> {
        let dir = self.portfolio_dir(hash);
        fs::create_dir_all(&dir).map_err(|e| RepositoryError::io(&dir, e))?;
        Ok(dir)
    }

    /// Replace `file` with `contents` through a temp file and a rename.
    /// Callers hold the write lock.
    fn write_atomic(&self, hash: &PortfolioHash, file: &str, contents: &[u8]) -> Result<(), RepositoryError> {
        let dir = self.create_dir(hash)?;
        let tmp = dir.join(format!("{file}.tmp"));
        let path = dir.join(file);
        fs::write(&tmp, contents).map_err(|e| RepositoryError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| RepositoryError::io(&path, e))?;
        Ok(())
    }

    fn remove(&self, hash: &PortfolioHash, file: &str) -> Result<(), RepositoryError> {
        let path = self.portfolio_dir(hash).join(file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepositoryError::io(&path, e)),
        }
    }

    /// Existing sequences plus `records`, written as a whole file.
    fn store_sequences(&self, hash: &PortfolioHash, records: &[SequenceRecord]) -> Result<(), RepositoryError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        let path = self.portfolio_dir(hash).join(SEQUENCES_FILE);
        let mut buf = match fs::read(&path) {
            Ok(existing) => existing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(RepositoryError::io(&path, e)),
        };
        if buf.last().is_some_and(|b| *b != b'\n') {
            buf.push(b'\n');
        }
        for r in records {
            serde_json::to_writer(&mut buf, r)?;
            buf.push(b'\n');
        }
        self.write_atomic(hash, SEQUENCES_FILE, &buf)
    }

    fn append_lines<T: Serialize>(&self, hash: &PortfolioHash, file: &str, records: &[T]) -> Result<(), RepositoryError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for r in records {
            buf.push_str(&serde_json::to_string(r)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        let path = self.create_dir(hash)?.join(file);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RepositoryError::io(&path, e))?;
        f.write_all(buf.as_bytes()).map_err(|e| RepositoryError::io(&path, e))?;
        f.flush().map_err(|e| RepositoryError::io(&path, e))?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(&self, hash: &PortfolioHash, file: &str) -> Result<Vec<T>, RepositoryError> {
        let path = self.portfolio_dir(hash).join(file);
        let f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RepositoryError::io(&path, e)),
        };

        let mut out = Vec::new();
        for (lineno, line) in io::BufReader::new(f).lines().enumerate() {
            let line = line.map_err(|e| RepositoryError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed record"),
            }
        }
        Ok(out)
    }
}

impl PlanRepository for JsonlRepository {
    fn append_sequence(&self, record: &SequenceRecord) -> Result<(), RepositoryError> {
        self.store_sequences(&record.portfolio_hash, std::slice::from_ref(record))
    }

    /// All-or-nothing: a failed write leaves the previous file in place.
    fn append_sequences(&self, records: &[SequenceRecord]) -> Result<(), RepositoryError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.store_sequences(&first.portfolio_hash, records)
    }

    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<(), RepositoryError> {
        self.append_lines(&record.portfolio_hash, EVALUATIONS_FILE, std::slice::from_ref(record))
    }

    fn append_evaluations(&self, records: &[EvaluationRecord]) -> Result<(), RepositoryError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.append_lines(&first.portfolio_hash, EVALUATIONS_FILE, records)
    }

    fn upsert_best_result(&self, best: &BestResult) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(best)?;
        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        self.write_atomic(&best.portfolio_hash, BEST_FILE, json.as_bytes())
    }

    fn commit_generation(&self, generation: &GenerationRecord) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(generation)?;
        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        self.write_atomic(&generation.portfolio_hash, GENERATION_FILE, json.as_bytes())
    }

    fn get_generation(&self, hash: &PortfolioHash) -> Result<Option<GenerationRecord>, RepositoryError> {
        let path = self.portfolio_dir(hash).join(GENERATION_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepositoryError::io(&path, e)),
        }
    }

    fn reset(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().map_err(|_| RepositoryError::Poisoned)?;
        // Marker first: a crash part way leaves an uncommitted set, never a
        // committed one with missing files.
        for file in [GENERATION_FILE, SEQUENCES_FILE, EVALUATIONS_FILE, BEST_FILE] {
            self.remove(hash, file)?;
        }
        Ok(())
    }

    fn try_claim(&self, hash: &PortfolioHash) -> Result<bool, RepositoryError> {
        self.create_dir(hash)?;
        let path = self.lock_path(hash);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                writeln!(f, "{}", std::process::id()).map_err(|e| RepositoryError::io(&path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(RepositoryError::io(&path, e)),
        }
    }

    fn release_claim(&self, hash: &PortfolioHash) -> Result<(), RepositoryError> {
        self.remove(hash, LOCK_FILE)
    }

    fn count_sequences(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        Ok(self.read_lines::<SequenceRecord>(hash, SEQUENCES_FILE)?.len())
    }

    fn count_evaluations(&self, hash: &PortfolioHash) -> Result<usize, RepositoryError> {
        Ok(self.read_lines::<EvaluationRecord>(hash, EVALUATIONS_FILE)?.len())
    }

    fn get_best_result(&self, hash: &PortfolioHash) -> Result<Option<BestResult>, RepositoryError> {
        let path = self.portfolio_dir(hash).join(BEST_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepositoryError::io(&path, e)),
        }
    }

    fn list_sequences(&self, hash: &PortfolioHash) -> Result<Vec<SequenceRecord>, RepositoryError> {
        let mut out: Vec<SequenceRecord> = self.read_lines(hash, SEQUENCES_FILE)?;
        out.sort_by_key(|r| r.index);
        Ok(out)
    }

    fn list_evaluations(&self, hash: &PortfolioHash) -> Result<Vec<EvaluationRecord>, RepositoryError> {
        self.read_lines(hash, EVALUATIONS_FILE)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
