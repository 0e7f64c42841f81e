//! Process Graph Module
//!
//! Immutable process definitions and everything attached to them.
//!
//! # Structure
//!
//! - [`model`]: Nodes, transitions, events and timers
//! - [`action`]: Action, decision and exception handlers
//! - [`expression`]: Decision and condition expressions
//! - [`parser`]: YAML loading
//! - [`validator`]: Structural checks run after loading

pub mod action;
pub mod expression;
pub mod model;
pub mod parser;
pub mod validator;

use thiserror::Error;

use crate::calendar::CalendarError;

pub use action::{decision_fn, Action, ActionHandler, ActionRegistry, DecisionHandler, ExceptionHandler};
pub use expression::{Expression, ExpressionError};
pub use model::{
    DecisionConfig, EventType, GraphElement, JoinConfig, JoinLockMode, Node, NodeId, NodeKind,
    ProcessDefinition, SubProcessConfig, TimerSpec, Transition, TransitionId, VariableMapping,
};
pub use parser::{load_definition, parse_definition};
pub use validator::{validate_definition, ValidationError};

/// Errors building or loading a process definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read process definition '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse process definition YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{node}' already has a leaving transition named '{transition}'")]
    DuplicateTransition { node: String, transition: String },

    #[error("{0:?} does not belong to this definition")]
    UnknownElement(GraphElement),

    #[error("{element} does not support event '{event}'")]
    UnknownEvent { element: String, event: String },

    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error("unknown action '{0}'; register it before loading the definition")]
    UnknownAction(String),

    #[error("invalid join lock mode '{0}'; expected NONE, READ, UPGRADE or PESSIMISTIC")]
    InvalidLockMode(String),

    #[error("invalid variable access '{0}'; expected read, write or both")]
    InvalidAccess(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error("invalid process definition:\n{0}")]
    Invalid(String),
}
