//! Engine Errors
//!
//! The error taxonomy surfaced by traversal, variable handling, jobs and the
//! external collaborators. Each concern keeps its own error type; this module
//! collects them into [`EngineError`] and adds the structural errors raised
//! while moving tokens through a process graph.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::calendar::CalendarError;
use crate::config::ConfigError;
use crate::graph::{DefinitionError, ExpressionError, GraphElement};
use crate::jobs::JobError;
use crate::services::{PersistenceError, ServiceError};
use crate::variables::VariableError;

/// Everything that can go wrong while driving process instances.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node '{node}' has no leaving transitions")]
    NoLeavingTransition { node: String },

    #[error("node '{node}' has {count} leaving transitions; a transition name is required")]
    AmbiguousTransition { node: String, count: usize },

    #[error("node '{node}' has no leaving transition named '{transition}'")]
    UnknownTransition { node: String, transition: String },

    #[error("process definition has no node named '{0}'")]
    UnknownNode(String),

    #[error("process definition has no element {0:?}")]
    UnknownElement(GraphElement),

    #[error("token {0} does not exist")]
    UnknownToken(usize),

    #[error("process instance {0} has ended")]
    InstanceEnded(u64),

    #[error("process instance {0} is suspended")]
    InstanceSuspended(u64),

    #[error("token '{0}' has ended")]
    TokenEnded(String),

    #[error("token '{0}' is suspended")]
    TokenSuspended(String),

    #[error("token '{token}' is locked by '{owner}'")]
    TokenLocked { token: String, owner: String },

    #[error("token '{token}' can't be locked by '{requested}': already locked by '{owner}'")]
    LockConflict {
        token: String,
        owner: String,
        requested: String,
    },

    #[error("decision '{node}' has no leaving transition for value '{value}'")]
    DecisionNoMatch { node: String, value: String },

    #[error("action {action} on {element} failed: {source}")]
    Action {
        element: String,
        action: String,
        #[source]
        source: ActionError,
    },

    #[error("unknown process definition '{0}'")]
    UnknownDefinition(String),

    #[error("unknown business calendar '{0}'")]
    UnknownCalendar(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// True when the failure is an optimistic-version conflict.
    ///
    /// Callers (typically job workers) use this to retry the whole unit of
    /// work instead of counting it as a failure.
    pub fn is_stale_version(&self) -> bool {
        match self {
            Self::Persistence(err) => err.is_stale_version(),
            Self::Action { source, .. } => source
                .engine_cause()
                .map_or(false, EngineError::is_stale_version),
            _ => false,
        }
    }
}

/// Failure raised by user action code.
///
/// `kind` plays the role of an exception class: exception handlers on graph
/// elements select on it.
#[derive(Debug, Clone)]
pub struct ActionError {
    pub kind: String,
    pub message: String,
    cause: Option<Arc<EngineError>>,
}

impl ActionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// The engine error that caused this action failure, if any.
    pub fn engine_cause(&self) -> Option<&EngineError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for ActionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|err| err as &(dyn Error + 'static))
    }
}

impl From<EngineError> for ActionError {
    fn from(err: EngineError) -> Self {
        Self {
            kind: "engine".to_string(),
            message: err.to_string(),
            cause: Some(Arc::new(err)),
        }
    }
}

impl From<VariableError> for ActionError {
    fn from(err: VariableError) -> Self {
        EngineError::from(err).into()
    }
}
