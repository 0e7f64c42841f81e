//! Jobs Module
//!
//! Deferred work that resumes token traversal later, and the machinery that
//! runs it.
//!
//! # Architecture
//!
//! - [`job`]: Jobs and timers
//! - [`queue`]: In-memory queue with job locks and retry accounting
//! - [`timer`]: Repeat due-date arithmetic
//! - [`executor`]: Worker threads draining due jobs

pub mod executor;
pub mod job;
pub mod queue;
pub mod timer;

use thiserror::Error;

use crate::execution::InstanceId;

pub use executor::{ExecutorSummary, JobExecutor, JobOutcome};
pub use job::{Job, JobId, JobKind, Timer};
pub use queue::JobQueue;
pub use timer::next_due_date;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {job} is locked by '{owner}'")]
    AlreadyLocked { job: JobId, owner: String },

    #[error("job {job} is exclusive and instance {instance} is busy")]
    InstanceLocked { job: JobId, instance: InstanceId },

    #[error("job {0} is suspended")]
    Suspended(JobId),
}
