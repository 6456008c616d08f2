// Background proof-of-work. Each job runs on its own thread and polls a shared
// cancel flag every `progress_interval` hashes. The job table mutex is held while
// a sealed block is committed, so a job is either cancelled or committed, never both.

use crate::core::{Block, ProofOfWork, SearchOutcome};
use crate::error::{BlockchainError, Result};
use crate::mining::job::{FailureReason, JobId, JobStatus, MiningJob, MiningStatus};
use crate::utils::Hash256;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Hands a sealed block to the chain; runs with the job table locked
pub type CommitFn = Box<dyn FnOnce(Block) -> Result<Hash256> + Send + 'static>;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub progress_interval: u64,
    pub retention: Duration,
    pub randomize_nonce_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            progress_interval: 10_000,
            retention: Duration::from_secs(300),
            randomize_nonce_start: true,
        }
    }
}

type JobTable = Arc<Mutex<HashMap<JobId, MiningJob>>>;

fn lock(jobs: &JobTable) -> MutexGuard<'_, HashMap<JobId, MiningJob>> {
    // A panic in a commit callback must not take the whole table down with it
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-flight mining scheduler: at most one job is pending or running
#[derive(Clone)]
pub struct MiningScheduler {
    jobs: JobTable,
    settings: SchedulerSettings,
}

impl MiningScheduler {
    pub fn new(settings: SchedulerSettings) -> MiningScheduler {
        MiningScheduler {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    /// Start searching for a nonce for `candidate` in the background.
    ///
    /// On success the sealed block goes to `commit`; the job reports
    /// `Succeeded` only if `commit` accepts it. Fails with `MinerBusy` when a
    /// job is already in flight.
    pub fn submit(&self, candidate: Block, commit: CommitFn) -> Result<JobId> {
        let mut jobs = lock(&self.jobs);
        Self::evict(&mut jobs, self.settings.retention);
        if let Some(busy) = jobs.values().find(|job| !job.status.is_terminal()) {
            return Err(BlockchainError::MinerBusy(busy.id.to_string()));
        }

        let job = MiningJob::new(candidate.index(), candidate.difficulty());
        let id = job.id;
        jobs.insert(id, job);
        drop(jobs);

        let start_nonce = if self.settings.randomize_nonce_start {
            rand::random::<u64>()
        } else {
            0
        };
        info!(
            "Mining job {id} started for block {} at difficulty {}",
            candidate.index(),
            candidate.difficulty()
        );

        let table = self.jobs.clone();
        let interval = self.settings.progress_interval;
        thread::Builder::new()
            .name(format!("miner-{id}"))
            .spawn(move || run_job(table, id, candidate, commit, start_nonce, interval))
            .map_err(|e| {
                let mut jobs = lock(&self.jobs);
                if let Some(job) = jobs.get_mut(&id) {
                    job.finish(
                        JobStatus::Failed,
                        Some(FailureReason::Rejected(format!("could not spawn miner: {e}"))),
                    );
                }
                BlockchainError::Io(format!("Failed to spawn mining thread: {e}"))
            })?;
        Ok(id)
    }

    pub fn status(&self, id: &JobId) -> Result<MiningStatus> {
        lock(&self.jobs)
            .get(id)
            .map(MiningJob::snapshot)
            .ok_or_else(|| BlockchainError::NotFound(format!("mining job {id}")))
    }

    /// True iff a pending or running job moved to `Cancelled`
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(id) {
            Some(job) if !job.status.is_terminal() => {
                job.cancel.store(true, Ordering::Release);
                job.finish(JobStatus::Cancelled, None);
                info!("Mining job {id} cancelled");
                true
            }
            _ => false,
        }
    }

    /// Every retained job, newest block first
    pub fn jobs(&self) -> Vec<MiningStatus> {
        let mut all: Vec<MiningStatus> = lock(&self.jobs)
            .values()
            .map(MiningJob::snapshot)
            .collect();
        all.sort_by(|a, b| {
            b.block_index
                .cmp(&a.block_index)
                .then(a.elapsed_ms.cmp(&b.elapsed_ms))
        });
        all
    }

    /// The job currently pending or running, if any
    pub fn active(&self) -> Option<JobId> {
        lock(&self.jobs)
            .values()
            .find(|job| !job.status.is_terminal())
            .map(|job| job.id)
    }

    /// Drop finished jobs older than the retention window; returns how many went
    pub fn evict_expired(&self) -> usize {
        Self::evict(&mut lock(&self.jobs), self.settings.retention)
    }

    fn evict(jobs: &mut HashMap<JobId, MiningJob>, retention: Duration) -> usize {
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(retention));
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!("Evicted {evicted} finished mining jobs");
        }
        evicted
    }

    /// Poll until the job is terminal or `timeout` passes
    pub fn wait(&self, id: &JobId, timeout: Duration) -> Result<MiningStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(id)?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(BlockchainError::Timeout(format!("mining job {id}")));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn run_job(
    jobs: JobTable,
    id: JobId,
    candidate: Block,
    commit: CommitFn,
    start_nonce: u64,
    interval: u64,
) {
    let cancel = {
        let mut table = lock(&jobs);
        match table.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.start();
                job.cancel.clone()
            }
            // Cancelled before the thread got going
            _ => return,
        }
    };

    let pow = ProofOfWork::new(candidate.header());
    let outcome = pow.search(start_nonce, interval, &cancel, |tried, hash| {
        if let Some(job) = lock(&jobs).get_mut(&id) {
            job.hashes_tried = tried;
            job.last_hash = Some(*hash);
            let status = job.snapshot();
            debug!(
                "Job {id}: {tried} hashes, {:.0} H/s, ~{:.1}s left",
                status.hash_rate,
                status.estimated_remaining_secs.unwrap_or(0.0)
            );
        }
    });

    let mut table = lock(&jobs);
    let Some(job) = table.get_mut(&id) else {
        return;
    };

    match outcome {
        SearchOutcome::Found {
            nonce,
            hash,
            hashes_tried,
        } => {
            job.hashes_tried = hashes_tried;
            job.last_hash = Some(hash);
            if job.status != JobStatus::Running {
                // Cancelled between the last poll and the hit; never commit
                return;
            }
            let sealed = candidate.seal(nonce);
            match commit(sealed) {
                Ok(block_hash) => {
                    job.block_hash = Some(block_hash);
                    job.finish(JobStatus::Succeeded, None);
                    info!(
                        "Mining job {id} sealed block {} ({}) after {hashes_tried} hashes",
                        job.block_index,
                        block_hash.short()
                    );
                }
                Err(e) => {
                    let reason = FailureReason::from_commit_error(&e);
                    warn!("Mining job {id} failed: {reason}");
                    job.finish(JobStatus::Failed, Some(reason));
                }
            }
        }
        SearchOutcome::Cancelled { hashes_tried } => {
            job.hashes_tried = hashes_tried;
            if !job.status.is_terminal() {
                job.finish(JobStatus::Cancelled, None);
            }
        }
        SearchOutcome::Exhausted { hashes_tried } => {
            job.hashes_tried = hashes_tried;
            if !job.status.is_terminal() {
                warn!("Mining job {id} exhausted the nonce space");
                job.finish(
                    JobStatus::Failed,
                    Some(FailureReason::NonceSpaceExhausted),
                );
            }
        }
    }
}
