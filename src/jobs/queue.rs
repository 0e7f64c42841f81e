//! Job Queue
//!
//! In-memory job store shared by the engine (as its messaging and scheduler
//! collaborator) and by workers. Workers acquire due jobs in due-date order.
//! An exclusive job runs only while no other job of its instance runs, and
//! holds a per-instance lock that keeps further jobs of that instance back.
//!
//! Job locks never expire. Only completion, rescheduling, release or a
//! manual [`JobQueue::reset`] clears them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use log::{debug, warn};

use super::job::{Job, JobId};
use super::JobError;
use crate::execution::{InstanceId, TokenId};
use crate::services::{MessageService, SchedulerService, ServiceError};

#[derive(Debug, Default)]
struct QueueState {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
    /// Instance -> worker running one of its exclusive jobs
    instance_locks: HashMap<InstanceId, String>,
}

impl QueueState {
    fn is_acquirable(&self, job: &Job, worker: &str, max_retries: u32) -> bool {
        if job.is_locked() || job.suspended {
            return false;
        }
        let held_elsewhere = self
            .instance_locks
            .get(&job.instance)
            .map_or(false, |holder| holder != worker);
        if held_elsewhere {
            return false;
        }
        if !job.exclusive {
            return true;
        }
        // Exhausted jobs stay locked but no longer run.
        !self.jobs.values().any(|other| {
            other.instance == job.instance
                && other.id != job.id
                && other.retries < max_retries
                && other.lock_owner.as_deref().map_or(false, |owner| owner != worker)
        })
    }

    fn lock(&mut self, id: JobId, worker: &str, now: NaiveDateTime) -> Option<Job> {
        let job = self.jobs.get_mut(&id)?;
        job.lock_owner = Some(worker.to_string());
        job.lock_time = Some(now);
        let job = job.clone();
        if job.exclusive {
            self.instance_locks.insert(job.instance, worker.to_string());
        }
        Some(job)
    }

    fn release_instance(&mut self, job: &Job) {
        if job.exclusive {
            if let Some(owner) = &job.lock_owner {
                if self.instance_locks.get(&job.instance) == Some(owner) {
                    self.instance_locks.remove(&job.instance);
                }
            }
        }
    }

    fn unlock(&mut self, id: JobId) -> Option<&mut Job> {
        let job = self.jobs.get(&id)?.clone();
        self.release_instance(&job);
        let job = self.jobs.get_mut(&id)?;
        job.lock_owner = None;
        job.lock_time = None;
        Some(job)
    }
}

#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    max_retries: u32,
}

impl JobQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_retries,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Stores a job under a fresh id.
    pub fn enqueue(&self, mut job: Job) -> JobId {
        let mut state = self.state();
        state.next_id += 1;
        job.id = state.next_id;
        debug!("Enqueued {} due {}", job, job.due_date);
        state.jobs.insert(job.id, job);
        state.next_id
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state().jobs.get(&id).cloned()
    }

    /// All jobs, in id order.
    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    pub fn jobs_for_instance(&self, instance: InstanceId) -> Vec<Job> {
        self.state()
            .jobs
            .values()
            .filter(|job| job.instance == instance)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims a specific job for `worker`.
    pub fn acquire(&self, id: JobId, worker: &str, now: NaiveDateTime) -> Result<Job, JobError> {
        let mut state = self.state();
        let job = state.jobs.get(&id).ok_or(JobError::NotFound(id))?;

        if let Some(owner) = &job.lock_owner {
            return Err(JobError::AlreadyLocked {
                job: id,
                owner: owner.clone(),
            });
        }
        if job.suspended {
            return Err(JobError::Suspended(id));
        }
        if !state.is_acquirable(job, worker, self.max_retries) {
            return Err(JobError::InstanceLocked {
                job: id,
                instance: job.instance,
            });
        }

        state.lock(id, worker, now).ok_or(JobError::NotFound(id))
    }

    /// Claims the earliest due job `worker` may run, if any.
    pub fn acquire_due(&self, worker: &str, now: NaiveDateTime) -> Option<Job> {
        let mut state = self.state();
        let id = state
            .jobs
            .values()
            .filter(|job| job.due_date <= now && state.is_acquirable(job, worker, self.max_retries))
            .min_by_key(|job| (job.due_date, job.id))
            .map(|job| job.id)?;
        state.lock(id, worker, now)
    }

    /// Earliest due date among jobs that could be acquired.
    pub fn next_due_date(&self) -> Option<NaiveDateTime> {
        self.state()
            .jobs
            .values()
            .filter(|job| !job.is_locked() && !job.suspended)
            .map(|job| job.due_date)
            .min()
    }

    /// Removes a finished job. A job deleted while it ran is not an error.
    pub fn complete(&self, id: JobId) {
        let mut state = self.state();
        if let Some(job) = state.jobs.remove(&id) {
            state.release_instance(&job);
        }
    }

    /// Keeps a repeating job with a new due date and clears its lock.
    pub fn reschedule(&self, id: JobId, due_date: NaiveDateTime) {
        if let Some(job) = self.state().unlock(id) {
            job.due_date = due_date;
            debug!("Rescheduled {} to {}", job, due_date);
        }
    }

    /// Gives a job back without counting a failure.
    pub fn release(&self, id: JobId) {
        self.state().unlock(id);
    }

    /// Records a failure.
    ///
    /// While retries remain the job is unlocked for another attempt; once
    /// exhausted it stays locked with its exception text. Returns the job's
    /// retry count and whether it is exhausted.
    pub fn fail(&self, id: JobId, error: &str) -> Option<(u32, bool)> {
        let mut state = self.state();
        let job = state.jobs.get(&id)?.clone();
        state.release_instance(&job);

        let job = state.jobs.get_mut(&id)?;
        job.retries += 1;
        job.exception = Some(error.to_string());

        let exhausted = job.retries >= self.max_retries;
        if exhausted {
            warn!("{} failed {} times; left locked: {}", job, job.retries, error);
        } else {
            job.lock_owner = None;
            job.lock_time = None;
        }
        Some((job.retries, exhausted))
    }

    /// Cancels a job.
    pub fn delete(&self, id: JobId) -> Option<Job> {
        let mut state = self.state();
        let job = state.jobs.remove(&id)?;
        state.release_instance(&job);
        Some(job)
    }

    /// Jobs whose retries are exhausted.
    pub fn failed_jobs(&self) -> Vec<Job> {
        self.state()
            .jobs
            .values()
            .filter(|job| job.retries >= self.max_retries)
            .cloned()
            .collect()
    }

    /// Makes a failed job eligible again with fresh retries.
    pub fn reset(&self, id: JobId) -> Result<(), JobError> {
        let mut state = self.state();
        let job = state.unlock(id).ok_or(JobError::NotFound(id))?;
        job.retries = 0;
        job.exception = None;
        Ok(())
    }

    fn delete_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Job) -> bool,
    {
        let mut state = self.state();
        let doomed: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| predicate(job))
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            if let Some(job) = state.jobs.remove(id) {
                state.release_instance(&job);
            }
        }
        doomed.len()
    }

    fn set_suspended(&self, instance: InstanceId, suspended: bool) -> usize {
        let mut state = self.state();
        let mut count = 0;
        for job in state.jobs.values_mut().filter(|job| job.instance == instance) {
            job.suspended = suspended;
            count += 1;
        }
        count
    }
}

impl MessageService for JobQueue {
    fn send(&self, job: Job) -> Result<JobId, ServiceError> {
        Ok(self.enqueue(job))
    }
}

impl SchedulerService for JobQueue {
    fn create_timer(&self, job: Job) -> Result<JobId, ServiceError> {
        if !job.is_timer() {
            return Err(ServiceError::Rejected {
                service: "scheduler",
                reason: format!("{} is not a timer", job),
            });
        }
        Ok(self.enqueue(job))
    }

    fn delete_timers_by_name(&self, name: &str, instance: InstanceId, token: TokenId) -> Result<usize, ServiceError> {
        Ok(self.delete_where(|job| {
            job.instance == instance
                && job.token == token
                && job.timer().map_or(false, |timer| timer.name == name)
        }))
    }

    fn delete_timers_by_process_instance(&self, instance: InstanceId) -> Result<usize, ServiceError> {
        Ok(self.delete_where(|job| job.instance == instance && job.is_timer()))
    }

    fn suspend_jobs(&self, instance: InstanceId) -> Result<usize, ServiceError> {
        Ok(self.set_suspended(instance, true))
    }

    fn resume_jobs(&self, instance: InstanceId) -> Result<usize, ServiceError> {
        Ok(self.set_suspended(instance, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphElement;
    use crate::jobs::{JobKind, Timer};
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn timer(name: &str, instance: InstanceId, due: NaiveDateTime) -> Job {
        Job::new(
            instance,
            0,
            due,
            JobKind::Timer(Timer {
                name: name.to_string(),
                repeat: None,
                transition: None,
                action: None,
                element: GraphElement::Node(1),
                calendar: None,
            }),
        )
    }

    fn node_job(instance: InstanceId, due: NaiveDateTime) -> Job {
        Job::new(instance, 0, due, JobKind::ExecuteNode { node: 1 })
    }

    #[test]
    fn test_acquire_in_due_order() {
        let queue = JobQueue::new(3);
        let late = queue.enqueue(node_job(1, at(11)));
        let early = queue.enqueue(node_job(2, at(9)));
        queue.enqueue(node_job(3, at(15)));

        assert_eq!(queue.acquire_due("w", at(12)).unwrap().id, early);
        assert_eq!(queue.acquire_due("w", at(12)).unwrap().id, late);
        assert!(queue.acquire_due("w", at(12)).is_none());
        assert_eq!(queue.next_due_date(), Some(at(15)));
    }

    #[test]
    fn test_locked_job_not_acquired_twice() {
        let queue = JobQueue::new(3);
        let id = queue.enqueue(node_job(1, at(9)));

        let job = queue.acquire(id, "w1", at(10)).unwrap();
        assert_eq!(job.lock_owner.as_deref(), Some("w1"));
        assert!(matches!(
            queue.acquire(id, "w2", at(10)),
            Err(JobError::AlreadyLocked { owner, .. }) if owner == "w1"
        ));
        assert!(matches!(queue.acquire(99, "w2", at(10)), Err(JobError::NotFound(99))));
    }

    #[test]
    fn test_exclusive_jobs_serialize_per_instance() {
        let queue = JobQueue::new(3);
        let first = queue.enqueue(node_job(7, at(9)).with_exclusive(true));
        let second = queue.enqueue(node_job(7, at(9)).with_exclusive(true));
        let other = queue.enqueue(node_job(8, at(9)).with_exclusive(true));

        assert_eq!(queue.acquire_due("w1", at(10)).unwrap().id, first);
        assert!(matches!(
            queue.acquire(second, "w2", at(10)),
            Err(JobError::InstanceLocked { instance: 7, .. })
        ));
        assert_eq!(queue.acquire_due("w2", at(10)).unwrap().id, other);

        queue.complete(first);
        assert_eq!(queue.acquire_due("w2", at(10)).unwrap().id, second);
    }

    #[test]
    fn test_exclusive_job_waits_for_running_jobs_of_its_instance() {
        let queue = JobQueue::new(3);
        let plain = queue.enqueue(node_job(7, at(9)));
        let exclusive = queue.enqueue(node_job(7, at(9)).with_exclusive(true));

        queue.acquire(plain, "w1", at(10)).unwrap();
        assert!(matches!(
            queue.acquire(exclusive, "w2", at(10)),
            Err(JobError::InstanceLocked { instance: 7, .. })
        ));
        assert!(queue.acquire_due("w2", at(10)).is_none());

        queue.complete(plain);
        assert_eq!(queue.acquire_due("w2", at(10)).unwrap().id, exclusive);
    }

    #[test]
    fn test_running_exclusive_job_holds_back_plain_jobs() {
        let queue = JobQueue::new(3);
        let exclusive = queue.enqueue(node_job(7, at(9)).with_exclusive(true));
        let plain = queue.enqueue(node_job(7, at(10)));

        queue.acquire(exclusive, "w1", at(10)).unwrap();
        assert!(queue.acquire_due("w2", at(10)).is_none());

        queue.complete(exclusive);
        assert_eq!(queue.acquire_due("w2", at(10)).unwrap().id, plain);
    }

    #[test]
    fn test_exhausted_job_does_not_block_exclusive_jobs() {
        let queue = JobQueue::new(1);
        let broken = queue.enqueue(node_job(7, at(9)));
        let exclusive = queue.enqueue(node_job(7, at(9)).with_exclusive(true));

        queue.acquire(broken, "w1", at(10)).unwrap();
        assert_eq!(queue.fail(broken, "boom"), Some((1, true)));
        assert!(queue.get(broken).unwrap().is_locked());
        assert_eq!(queue.acquire(exclusive, "w2", at(10)).unwrap().id, exclusive);
    }

    #[test]
    fn test_failure_counts_retries_until_exhausted() {
        let queue = JobQueue::new(2);
        let id = queue.enqueue(node_job(1, at(9)));

        queue.acquire(id, "w", at(10)).unwrap();
        assert_eq!(queue.fail(id, "boom"), Some((1, false)));
        assert!(!queue.get(id).unwrap().is_locked());

        queue.acquire(id, "w", at(10)).unwrap();
        assert_eq!(queue.fail(id, "boom again"), Some((2, true)));

        let failed = queue.get(id).unwrap();
        assert!(failed.is_locked());
        assert_eq!(failed.exception.as_deref(), Some("boom again"));
        assert_eq!(queue.failed_jobs().len(), 1);
        assert!(queue.acquire_due("w", at(10)).is_none());

        queue.reset(id).unwrap();
        assert!(queue.failed_jobs().is_empty());
        assert!(queue.acquire_due("w", at(10)).is_some());
    }

    #[test]
    fn test_release_does_not_count_retry() {
        let queue = JobQueue::new(3);
        let id = queue.enqueue(node_job(1, at(9)));
        queue.acquire(id, "w", at(10)).unwrap();
        queue.release(id);

        let job = queue.get(id).unwrap();
        assert!(!job.is_locked());
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn test_reschedule_clears_lock() {
        let queue = JobQueue::new(3);
        let id = queue.enqueue(timer("t", 1, at(9)));
        queue.acquire(id, "w", at(9)).unwrap();
        queue.reschedule(id, at(13));

        let job = queue.get(id).unwrap();
        assert_eq!(job.due_date, at(13));
        assert!(!job.is_locked());

        queue.complete(42);
        queue.reschedule(42, at(14));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_timer_cancellation() {
        let queue = JobQueue::new(3);
        queue.enqueue(timer("reminder", 1, at(9)));
        queue.enqueue(timer("escalate", 1, at(9)));
        queue.enqueue(timer("reminder", 2, at(9)));
        queue.enqueue(node_job(1, at(9)));

        assert_eq!(queue.delete_timers_by_name("reminder", 1, 0).unwrap(), 1);
        assert_eq!(queue.delete_timers_by_process_instance(1).unwrap(), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.create_timer(node_job(1, at(9))).is_err());
    }

    #[test]
    fn test_suspended_jobs_are_skipped() {
        let queue = JobQueue::new(3);
        let id = queue.enqueue(node_job(1, at(9)));
        queue.suspend_jobs(1).unwrap();

        assert!(queue.acquire_due("w", at(10)).is_none());
        assert!(matches!(queue.acquire(id, "w", at(10)), Err(JobError::Suspended(_))));

        queue.resume_jobs(1).unwrap();
        assert!(queue.acquire_due("w", at(10)).is_some());
    }
}
