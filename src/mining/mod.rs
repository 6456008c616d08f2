//! Background proof-of-work mining
//!
//! Jobs are tracked by id, run on their own thread, report progress, and can
//! be cancelled cooperatively.

pub mod job;
pub mod scheduler;

pub use job::{estimate_time, FailureReason, JobId, JobStatus, MiningStatus};
pub use scheduler::{CommitFn, MiningScheduler, SchedulerSettings};
