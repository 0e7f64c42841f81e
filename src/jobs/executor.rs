//! Job Executor
//!
//! Worker threads that acquire due jobs, run them against a freshly loaded
//! instance and save the result. One job is one unit of work: a failed or
//! stale job leaves the stored instance untouched, and the jobs and timer
//! changes it made are discarded with it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::job::{Job, JobId};
use super::queue::JobQueue;
use super::JobError;
use crate::error::EngineError;
use crate::execution::ProcessEngine;
use crate::services::PersistenceError;

/// How long an idle worker waits while others are still busy.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What happened to one acquired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// A repeating timer moved to its next due date
    Rescheduled,
    Failed { retries: u32, exhausted: bool },
    /// Lost an optimistic-version race; released for another attempt
    Stale,
    /// Its instance no longer exists; the job was deleted
    Orphaned,
    /// Failed after the job itself was deleted, so it can't be retried
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorSummary {
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub stale: usize,
    pub orphaned: usize,
    pub lost: usize,
}

impl ExecutorSummary {
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Rescheduled => self.rescheduled += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Stale => self.stale += 1,
            JobOutcome::Orphaned => self.orphaned += 1,
            JobOutcome::Lost => self.lost += 1,
        }
    }

    /// Jobs executed, whatever the outcome.
    pub fn total(&self) -> usize {
        self.completed + self.rescheduled + self.failed + self.stale + self.orphaned + self.lost
    }
}

/// Drains due jobs from a [`JobQueue`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::config::EngineConfig;
/// use flowrunner::execution::ProcessEngine;
/// use flowrunner::jobs::JobExecutor;
/// use flowrunner::services::Services;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (services, queue) = Services::in_memory(3);
///     let engine = Arc::new(ProcessEngine::new(EngineConfig::default(), services)?);
///
///     let summary = JobExecutor::new(engine, queue).with_workers(4).run_until_idle();
///     println!("{} jobs completed", summary.completed);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct JobExecutor {
    engine: Arc<ProcessEngine>,
    queue: Arc<JobQueue>,
    name: String,
    workers: usize,
}

impl JobExecutor {
    pub fn new(engine: Arc<ProcessEngine>, queue: Arc<JobQueue>) -> Self {
        let jobs = &engine.config().jobs;
        let name = jobs.executor_name.clone();
        let workers = jobs.workers.max(1);
        Self {
            engine,
            queue,
            name,
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Lock owner name of worker `index`.
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}:{}", self.name, index)
    }

    /// Acquires and runs the earliest due job, if there is one.
    pub fn execute_next(&self, worker: &str) -> Option<JobOutcome> {
        let job = self.queue.acquire_due(worker, self.engine.now())?;
        Some(self.run(job))
    }

    /// Acquires and runs a specific job regardless of its due date.
    pub fn execute_job(&self, id: JobId, worker: &str) -> Result<JobOutcome, JobError> {
        let job = self.queue.acquire(id, worker, self.engine.now())?;
        Ok(self.run(job))
    }

    /// Runs due jobs on the configured number of threads until none is
    /// left that any worker could acquire.
    ///
    /// Jobs created while running are picked up as long as they are due.
    pub fn run_until_idle(&self) -> ExecutorSummary {
        info!("Job executor '{}' starting {} workers", self.name, self.workers);

        let busy = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::<JobOutcome>();

        let handles: Vec<_> = (0..self.workers)
            .map(|index| {
                let executor = self.clone();
                let busy = Arc::clone(&busy);
                let tx = tx.clone();
                let worker = self.worker_name(index);
                thread::spawn(move || executor.work(&worker, &busy, &tx))
            })
            .collect();
        drop(tx);

        let mut summary = ExecutorSummary::default();
        for outcome in rx {
            summary.record(outcome);
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("Job worker thread panicked");
            }
        }

        info!(
            "Job executor '{}' idle: {} completed, {} rescheduled, {} failed, {} stale, {} orphaned, {} lost",
            self.name,
            summary.completed,
            summary.rescheduled,
            summary.failed,
            summary.stale,
            summary.orphaned,
            summary.lost
        );
        summary
    }

    fn work(&self, worker: &str, busy: &AtomicUsize, tx: &Sender<JobOutcome>) {
        debug!("Worker '{}' started", worker);
        loop {
            busy.fetch_add(1, Ordering::SeqCst);
            match self.execute_next(worker) {
                Some(outcome) => {
                    busy.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = tx.send(outcome) {
                        error!("Failed to report job outcome: {}", e);
                    }
                }
                None => {
                    // Someone else may still produce due jobs.
                    if busy.fetch_sub(1, Ordering::SeqCst) == 1 {
                        break;
                    }
                    thread::sleep(IDLE_POLL_INTERVAL);
                }
            }
        }
        debug!("Worker '{}' finished", worker);
    }

    fn run(&self, mut job: Job) -> JobOutcome {
        debug!("Running {}", job);
        let mut instance = match self.engine.load(job.instance) {
            Ok(instance) => instance,
            Err(EngineError::Persistence(PersistenceError::NotFound(id))) => {
                warn!("Deleting {}: process instance {} no longer exists", job, id);
                self.queue.delete(job.id);
                return JobOutcome::Orphaned;
            }
            Err(err) => return self.fail(&job, &err),
        };
        instance.defer_jobs();

        let result = self
            .engine
            .execute_job(&mut instance, &mut job)
            .and_then(|done| self.engine.save(&mut instance).map(|()| done));

        match result {
            Ok(true) => {
                self.queue.complete(job.id);
                JobOutcome::Completed
            }
            Ok(false) => {
                self.queue.reschedule(job.id, job.due_date);
                JobOutcome::Rescheduled
            }
            Err(err) if err.is_stale_version() => {
                debug!("{} lost a version race; releasing: {}", job, err);
                self.queue.release(job.id);
                JobOutcome::Stale
            }
            Err(err) => self.fail(&job, &err),
        }
    }

    fn fail(&self, job: &Job, err: &EngineError) -> JobOutcome {
        error!("{} failed: {}", job, err);
        match self.queue.fail(job.id, &err.to_string()) {
            Some((retries, exhausted)) => JobOutcome::Failed { retries, exhausted },
            None => {
                error!("{} was deleted while it ran; its failure can't be retried", job);
                JobOutcome::Lost
            }
        }
    }
}
