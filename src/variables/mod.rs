//! Process Variables Module
//!
//! Hierarchical, typed variables attached to tokens:
//! - [`VariableValue`]: runtime values
//! - [`TypeRegistry`]: ordered value-to-storage mappings
//! - [`VariableInstance`]: stored form of one variable
//! - [`VariableScope`]: per-token containers with ancestor resolution

pub mod container;
pub mod instance;
pub mod types;
pub mod value;

use thiserror::Error;

pub use container::{SetOutcome, TokenLineage, VariableContainer, VariableScope};
pub use instance::{StoredValue, VariableInstance};
pub use types::{Converter, TypeMapping, TypeRegistry, VariableKind, DEFAULT_TYPES};
pub use value::{EntityRef, OpaqueValue, VariableValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariableError {
    #[error("variable '{name}': {kind:?} storage can't hold a {value_type} value")]
    Unsupported {
        name: String,
        kind: VariableKind,
        value_type: String,
    },

    #[error("variable '{name}': conversion failed: {reason}")]
    Conversion { name: String, reason: String },

    #[error("variable '{name}' holds an unpersistable {value_type} value")]
    Unpersistable { name: String, value_type: String },

    #[error("unknown variable type mapping '{0}'")]
    UnknownType(String),
}
