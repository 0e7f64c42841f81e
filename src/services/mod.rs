//! Services Module
//!
//! The narrow contracts through which the engine reaches its collaborators:
//! - [`PersistenceService`]: save/load instances, deploy definitions
//! - [`MessageService`]: hand jobs off for later execution
//! - [`SchedulerService`]: create and cancel timers
//! - [`LoggingService`]: append process log entries
//! - [`AuthorizationService`]: permission checks
//! - [`Clock`]: the current time

pub mod clock;
pub mod logging;
pub mod persistence;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::execution::{InstanceId, TokenId};
use crate::jobs::{Job, JobId, JobQueue};

pub use clock::{Clock, FixedClock, SystemClock};
pub use logging::{LogEvent, LoggingService, MemoryLog, ProcessLog, TraceLog};
pub use persistence::{write_snapshot, MemoryPersistence, PersistenceError, PersistenceService};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{service} rejected the request: {reason}")]
    Rejected { service: &'static str, reason: String },
}

/// Delivers jobs to workers.
pub trait MessageService: Send + Sync {
    fn send(&self, job: Job) -> Result<JobId, ServiceError>;
}

/// Creates and cancels timers.
pub trait SchedulerService: Send + Sync {
    fn create_timer(&self, job: Job) -> Result<JobId, ServiceError>;

    /// Cancels the timers called `name` on one token; returns how many.
    fn delete_timers_by_name(&self, name: &str, instance: InstanceId, token: TokenId) -> Result<usize, ServiceError>;

    fn delete_timers_by_process_instance(&self, instance: InstanceId) -> Result<usize, ServiceError>;

    /// Keeps every job of `instance` from being acquired.
    fn suspend_jobs(&self, instance: InstanceId) -> Result<usize, ServiceError>;

    fn resume_jobs(&self, instance: InstanceId) -> Result<usize, ServiceError>;
}

/// A messaging or scheduler call an instance holds back until it is saved.
#[derive(Debug, Clone)]
pub enum DeferredOperation {
    Send(Job),
    CreateTimer(Job),
    DeleteTimersByName {
        name: String,
        instance: InstanceId,
        token: TokenId,
    },
    DeleteTimersByProcessInstance(InstanceId),
    SuspendJobs(InstanceId),
    ResumeJobs(InstanceId),
}

/// A state-changing operation on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub operation: &'static str,
    pub instance: InstanceId,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on instance {}", self.operation, self.instance)
    }
}

pub trait AuthorizationService: Send + Sync {
    fn check_permission(&self, permission: &Permission) -> bool;
}

/// The collaborators one engine talks to.
#[derive(Clone)]
pub struct Services {
    persistence: Arc<dyn PersistenceService>,
    messaging: Arc<dyn MessageService>,
    scheduler: Arc<dyn SchedulerService>,
    logging: Arc<dyn LoggingService>,
    authorization: Option<Arc<dyn AuthorizationService>>,
    clock: Arc<dyn Clock>,
}

impl Services {
    /// In-memory persistence, a shared job queue for messaging and
    /// scheduling, trace logging and the system clock.
    pub fn in_memory(max_retries: u32) -> (Self, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new(max_retries));
        let services = Self {
            persistence: Arc::new(MemoryPersistence::new()),
            messaging: queue.clone(),
            scheduler: queue.clone(),
            logging: Arc::new(TraceLog),
            authorization: None,
            clock: Arc::new(SystemClock),
        };
        (services, queue)
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceService>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_messaging(mut self, messaging: Arc<dyn MessageService>) -> Self {
        self.messaging = messaging;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn SchedulerService>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_logging(mut self, logging: Arc<dyn LoggingService>) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn AuthorizationService>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn persistence(&self) -> &dyn PersistenceService {
        self.persistence.as_ref()
    }

    pub fn messaging(&self) -> &dyn MessageService {
        self.messaging.as_ref()
    }

    pub fn scheduler(&self) -> &dyn SchedulerService {
        self.scheduler.as_ref()
    }

    pub fn logging(&self) -> &dyn LoggingService {
        self.logging.as_ref()
    }

    pub fn authorization(&self) -> Option<&dyn AuthorizationService> {
        self.authorization.as_deref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Performs `operation`; returns how many jobs it touched.
    pub fn apply(&self, operation: DeferredOperation) -> Result<usize, ServiceError> {
        match operation {
            DeferredOperation::Send(job) => self.messaging.send(job).map(|_| 1),
            DeferredOperation::CreateTimer(job) => self.scheduler.create_timer(job).map(|_| 1),
            DeferredOperation::DeleteTimersByName { name, instance, token } => {
                self.scheduler.delete_timers_by_name(&name, instance, token)
            }
            DeferredOperation::DeleteTimersByProcessInstance(instance) => {
                self.scheduler.delete_timers_by_process_instance(instance)
            }
            DeferredOperation::SuspendJobs(instance) => self.scheduler.suspend_jobs(instance),
            DeferredOperation::ResumeJobs(instance) => self.scheduler.resume_jobs(instance),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("authorization", &self.authorization.is_some())
            .finish_non_exhaustive()
    }
}
