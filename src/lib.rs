//! FlowRunner - Graph-Oriented Process Engine
//!
//! Runs process definitions (directed graphs of nodes and transitions) by
//! moving tokens through them. Tokens wait in states, split at forks,
//! recombine at joins and resume later through jobs and business-time
//! timers.
//!
//! # Architecture
//!
//! - [`graph`]: Process definitions, actions, expressions and YAML loading
//! - [`execution`]: The engine, tokens and process instances
//! - [`variables`]: Hierarchical, typed process variables
//! - [`jobs`]: Job queue, timers and worker threads
//! - [`calendar`]: Business-hours calendar arithmetic
//! - [`services`]: Persistence, messaging, scheduling, logging and clock
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::config::EngineConfig;
//! use flowrunner::execution::ProcessEngine;
//! use flowrunner::graph::{load_definition, ActionRegistry};
//! use flowrunner::services::Services;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition = load_definition("order.yaml", &ActionRegistry::with_builtins())?;
//!
//!     let (services, _queue) = Services::in_memory(3);
//!     let engine = Arc::new(ProcessEngine::new(EngineConfig::load_or_default()?, services)?);
//!
//!     let mut instance = engine.start_process(engine.deploy(definition))?;
//!     engine.signal(&mut instance)?;
//!     engine.save(&mut instance)?;
//!     Ok(())
//! }
//! ```

pub mod calendar;
pub mod config;
pub mod error;
pub mod execution;
pub mod graph;
pub mod jobs;
pub mod services;
pub mod variables;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ActionError, EngineError};
pub use execution::{ExecutionContext, ProcessEngine, ProcessInstance, TokenId, ROOT_TOKEN};
pub use graph::{load_definition, parse_definition, ActionRegistry, ProcessDefinition};
pub use jobs::{JobExecutor, JobQueue};
pub use services::Services;
pub use variables::VariableValue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_yaml_process_runs_end_to_end() {
        let yaml = r#"
name: approval
nodes:
  - name: start
    type: start
    transitions:
      - to: review
  - name: review
    type: state
    transitions:
      - to: end
        name: approve
  - name: end
    type: end
"#;
        let definition = parse_definition(yaml, &ActionRegistry::with_builtins()).unwrap();
        let (services, _queue) = Services::in_memory(3);
        let engine = ProcessEngine::new(EngineConfig::default(), services).unwrap();

        let mut instance = engine.start_process(engine.deploy(definition)).unwrap();
        engine.signal(&mut instance).unwrap();
        assert_eq!(instance.definition().node(instance.root_token().node).name, "review");

        engine.signal_transition(&mut instance, ROOT_TOKEN, "approve").unwrap();
        assert!(instance.has_ended());
    }
}
