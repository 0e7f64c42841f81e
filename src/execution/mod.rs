//! Process Execution Module
//!
//! Runs process instances: tokens move through the graph on signals and
//! jobs, firing events and running actions on the way.
//!
//! # Architecture
//!
//! - [`engine`]: Public entry points and engine-wide services
//! - [`traversal`]: Leaving, taking and entering; events and exceptions
//! - [`nodes`]: Behaviour of each node kind
//! - [`continuation`]: Async continuations and job execution
//! - [`context`]: The view handed to actions
//! - [`instance`] / [`token`]: Runtime state

pub mod context;
pub mod continuation;
pub mod engine;
pub mod instance;
pub mod nodes;
pub mod token;
pub mod traversal;

pub use context::ExecutionContext;
pub use engine::ProcessEngine;
pub use instance::{InstanceId, InstanceSnapshot, ProcessInstance, SuperProcessToken};
pub use token::{Token, TokenId, TokenLock, TokenTree, ROOT_TOKEN};
