//! Jobs
//!
//! A job is deferred work that resumes traversal of one token: a timer, an
//! asynchronous node continuation or an asynchronous action.

use std::fmt;

use chrono::NaiveDateTime;

use crate::execution::{InstanceId, TokenId};
use crate::graph::{Action, EventType, GraphElement, NodeId};

pub type JobId = u64;

/// A job with repeat and transition semantics, created by nodes and actions.
#[derive(Debug, Clone)]
pub struct Timer {
    pub name: String,
    /// Duration expression between firings
    pub repeat: Option<String>,
    /// Transition taken when the timer fires
    pub transition: Option<String>,
    pub action: Option<Action>,
    /// Element whose `timer` event fires
    pub element: GraphElement,
    /// Business calendar for due dates; the default one when absent
    pub calendar: Option<String>,
}

#[derive(Debug, Clone)]
pub enum JobKind {
    Timer(Timer),
    /// Runs a node's behaviour outside the signalling call
    ExecuteNode { node: NodeId },
    /// Runs an action outside the signalling call
    ExecuteAction {
        action: Action,
        element: GraphElement,
        event: Option<EventType>,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Assigned when enqueued
    pub id: JobId,
    pub due_date: NaiveDateTime,
    pub instance: InstanceId,
    pub token: TokenId,
    /// Must not run alongside other jobs of the same instance
    pub exclusive: bool,
    pub lock_owner: Option<String>,
    pub lock_time: Option<NaiveDateTime>,
    /// Failures so far
    pub retries: u32,
    /// Text of the last failure
    pub exception: Option<String>,
    pub suspended: bool,
    pub kind: JobKind,
}

impl Job {
    pub fn new(instance: InstanceId, token: TokenId, due_date: NaiveDateTime, kind: JobKind) -> Self {
        Self {
            id: 0,
            due_date,
            instance,
            token,
            exclusive: false,
            lock_owner: None,
            lock_time: None,
            retries: 0,
            exception: None,
            suspended: false,
            kind,
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn timer(&self) -> Option<&Timer> {
        match &self.kind {
            JobKind::Timer(timer) => Some(timer),
            _ => None,
        }
    }

    pub fn is_timer(&self) -> bool {
        self.timer().is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JobKind::Timer(timer) => write!(f, "timer '{}' ({})", timer.name, self.id),
            JobKind::ExecuteNode { node } => write!(f, "execute-node {} ({})", node, self.id),
            JobKind::ExecuteAction { action, .. } => {
                write!(f, "execute-action {} ({})", action.label(), self.id)
            }
        }
    }
}
