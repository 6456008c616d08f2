use crate::core::ProofOfWork;
use crate::error::{BlockchainError, Result};
use crate::utils::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> JobId {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| BlockchainError::NotFound(format!("mining job {s}: {e}")))
    }
}

/// `Pending -> Running -> {Succeeded, Cancelled, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The chain moved past the parent the candidate was built on
    StaleParent,
    /// The chain refused the sealed block
    Rejected(String),
    /// Every nonce was tried without meeting the target
    NonceSpaceExhausted,
    /// The block was valid but could not be stored
    Persistence(String),
}

impl FailureReason {
    /// Classify a commit error
    pub fn from_commit_error(err: &BlockchainError) -> FailureReason {
        match err {
            BlockchainError::StaleParent { .. } => FailureReason::StaleParent,
            BlockchainError::Persistence(_)
            | BlockchainError::CorruptStore(_)
            | BlockchainError::Io(_) => FailureReason::Persistence(err.to_string()),
            other => FailureReason::Rejected(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StaleParent => write!(f, "stale parent"),
            FailureReason::Rejected(msg) => write!(f, "rejected: {msg}"),
            FailureReason::NonceSpaceExhausted => write!(f, "nonce space exhausted"),
            FailureReason::Persistence(msg) => write!(f, "persistence: {msg}"),
        }
    }
}

/// Point-in-time view of a job, safe to hand to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningStatus {
    pub id: JobId,
    pub block_index: u64,
    pub difficulty: u32,
    pub status: JobStatus,
    pub failure: Option<FailureReason>,
    pub hashes_tried: u64,
    pub elapsed_ms: u64,
    /// Hashes per second so far
    pub hash_rate: f64,
    /// Extrapolated from the hash rate; `None` until there is a rate or once finished
    pub estimated_remaining_secs: Option<f64>,
    pub last_hash: Option<Hash256>,
    /// Hash of the committed block, set only on success
    pub block_hash: Option<Hash256>,
}

/// Seconds to expect for `difficulty` at `hash_rate` hashes per second
pub fn estimate_time(difficulty: u32, hash_rate: f64) -> Option<f64> {
    if hash_rate > 0.0 {
        Some(ProofOfWork::expected_hashes(difficulty) / hash_rate)
    } else {
        None
    }
}

/// Scheduler-owned job record
pub(crate) struct MiningJob {
    pub(crate) id: JobId,
    pub(crate) block_index: u64,
    pub(crate) difficulty: u32,
    pub(crate) status: JobStatus,
    pub(crate) failure: Option<FailureReason>,
    pub(crate) hashes_tried: u64,
    pub(crate) last_hash: Option<Hash256>,
    pub(crate) block_hash: Option<Hash256>,
    pub(crate) cancel: Arc<AtomicBool>,
    created: Instant,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl MiningJob {
    pub(crate) fn new(block_index: u64, difficulty: u32) -> MiningJob {
        MiningJob {
            id: JobId::new(),
            block_index,
            difficulty,
            status: JobStatus::Pending,
            failure: None,
            hashes_tried: 0,
            last_hash: None,
            block_hash: None,
            cancel: Arc::new(AtomicBool::new(false)),
            created: Instant::now(),
            started: None,
            finished: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started = Some(Instant::now());
    }

    pub(crate) fn finish(&mut self, status: JobStatus, failure: Option<FailureReason>) {
        self.status = status;
        self.failure = failure;
        self.finished = Some(Instant::now());
    }

    pub(crate) fn is_expired(&self, retention: Duration) -> bool {
        self.finished
            .map(|at| at.elapsed() >= retention)
            .unwrap_or(false)
    }

    fn elapsed(&self) -> Duration {
        let start = self.started.unwrap_or(self.created);
        match self.finished {
            Some(end) => end.saturating_duration_since(start),
            None => start.elapsed(),
        }
    }

    pub(crate) fn snapshot(&self) -> MiningStatus {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        let hash_rate = if secs > 0.0 {
            self.hashes_tried as f64 / secs
        } else {
            0.0
        };
        let estimated_remaining_secs = if self.status.is_terminal() {
            None
        } else {
            estimate_time(self.difficulty, hash_rate).map(|total| {
                let done = if hash_rate > 0.0 {
                    self.hashes_tried as f64 / hash_rate
                } else {
                    0.0
                };
                (total - done).max(0.0)
            })
        };

        MiningStatus {
            id: self.id,
            block_index: self.block_index,
            difficulty: self.difficulty,
            status: self.status,
            failure: self.failure.clone(),
            hashes_tried: self.hashes_tried,
            elapsed_ms: elapsed.as_millis() as u64,
            hash_rate,
            estimated_remaining_secs,
            last_hash: self.last_hash,
            block_hash: self.block_hash,
        }
    }
}
