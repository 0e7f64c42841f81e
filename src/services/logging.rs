//! Process Log
//!
//! Typed, append-only audit entries emitted while instances run. The engine
//! never reads them back; sinks decide what to keep.

use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::NaiveDateTime;
use log::debug;
use serde::Serialize;

use crate::execution::{InstanceId, TokenId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LogEvent {
    ProcessStart,
    ProcessEnd,
    TokenCreate { name: String },
    TokenEnd,
    Signal { transition: Option<String> },
    NodeEnter { node: String },
    NodeLeave { node: String },
    TransitionTaken { transition: String },
    ActionExecuted { action: String },
    ActionFailed { action: String, error: String },
    ExceptionHandled { element: String, kind: String },
    VariableCreate { name: String },
    VariableUpdate { name: String },
    VariableDelete { name: String },
    TimerCreated { name: String },
    TimerCancelled { name: String },
    SubProcessCreated { instance: InstanceId },
    SubProcessEnd { instance: InstanceId },
    JoinReleased { node: String },
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessStart => write!(f, "process started"),
            Self::ProcessEnd => write!(f, "process ended"),
            Self::TokenCreate { name } => write!(f, "token '{}' created", name),
            Self::TokenEnd => write!(f, "token ended"),
            Self::Signal { transition: Some(name) } => write!(f, "signal over '{}'", name),
            Self::Signal { transition: None } => write!(f, "signal"),
            Self::NodeEnter { node } => write!(f, "entered '{}'", node),
            Self::NodeLeave { node } => write!(f, "left '{}'", node),
            Self::TransitionTaken { transition } => write!(f, "took {}", transition),
            Self::ActionExecuted { action } => write!(f, "action {} executed", action),
            Self::ActionFailed { action, error } => write!(f, "action {} failed: {}", action, error),
            Self::ExceptionHandled { element, kind } => write!(f, "{} handled '{}'", element, kind),
            Self::VariableCreate { name } => write!(f, "variable '{}' created", name),
            Self::VariableUpdate { name } => write!(f, "variable '{}' updated", name),
            Self::VariableDelete { name } => write!(f, "variable '{}' deleted", name),
            Self::TimerCreated { name } => write!(f, "timer '{}' created", name),
            Self::TimerCancelled { name } => write!(f, "timer '{}' cancelled", name),
            Self::SubProcessCreated { instance } => write!(f, "sub-process {} created", instance),
            Self::SubProcessEnd { instance } => write!(f, "sub-process {} ended", instance),
            Self::JoinReleased { node } => write!(f, "join '{}' released parent", node),
        }
    }
}

/// One process log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessLog {
    pub instance: InstanceId,
    pub token: TokenId,
    /// Per-token sequence number
    pub index: u64,
    pub time: NaiveDateTime,
    #[serde(flatten)]
    pub event: LogEvent,
}

pub trait LoggingService: Send + Sync {
    fn log(&self, entry: ProcessLog);
}

/// Keeps every entry in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<ProcessLog>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ProcessLog> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one instance, in logging order.
    pub fn events(&self, instance: InstanceId) -> Vec<LogEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.instance == instance)
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LoggingService for MemoryLog {
    fn log(&self, entry: ProcessLog) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Forwards entries to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLog;

impl LoggingService for TraceLog {
    fn log(&self, entry: ProcessLog) {
        debug!(
            target: "flowrunner::process",
            "[{}:{}#{}] {}",
            entry.instance,
            entry.token,
            entry.index,
            entry.event
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn entry(instance: InstanceId, index: u64, event: LogEvent) -> ProcessLog {
        ProcessLog {
            instance,
            token: 0,
            index,
            time: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            event,
        }
    }

    #[test]
    fn test_memory_log_filters_by_instance() {
        let log = MemoryLog::new();
        log.log(entry(1, 0, LogEvent::ProcessStart));
        log.log(entry(2, 0, LogEvent::ProcessStart));
        log.log(entry(1, 1, LogEvent::ProcessEnd));

        assert_eq!(log.len(), 3);
        assert_eq!(log.events(1), vec![LogEvent::ProcessStart, LogEvent::ProcessEnd]);
    }

    #[test]
    fn test_event_display() {
        let event = LogEvent::Signal {
            transition: Some("approve".to_string()),
        };
        assert_eq!(event.to_string(), "signal over 'approve'");
        assert_eq!(LogEvent::TokenEnd.to_string(), "token ended");
    }
}
