//! Process Definition Parser
//!
//! Loads process definitions from YAML. Nodes are declared in order with
//! their leaving transitions; transitions refer to their target by name.
//! Action references are resolved against an [`ActionRegistry`] once, here,
//! so a loaded definition never looks names up again.
//!
//! ```yaml
//! name: approval
//! nodes:
//!   - name: start
//!     type: start
//!     transitions:
//!       - to: review
//!   - name: review
//!     type: state
//!     events:
//!       node-enter: [log]
//!     timers:
//!       - name: reminder
//!         due: 2 business hours
//!         transition: approve
//!     transitions:
//!       - name: approve
//!         to: end
//!   - name: end
//!     type: end
//! ```

use std::collections::BTreeMap;
use std::fs;

use log::{debug, info};
use serde::Deserialize;

use super::action::{Action, ActionRegistry, ExceptionHandler};
use super::expression::Expression;
use super::model::{
    DecisionConfig, EventType, GraphElement, JoinConfig, JoinLockMode, NodeKind, ProcessDefinition,
    SubProcessConfig, TimerSpec, VariableMapping,
};
use super::validator::validate_definition;
use super::DefinitionError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionDoc {
    name: String,
    #[serde(default)]
    events: BTreeMap<String, Vec<ActionDoc>>,
    #[serde(default)]
    exception_handlers: Vec<HandlerDoc>,
    nodes: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeDoc {
    name: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    transitions: Vec<TransitionDoc>,
    #[serde(default)]
    events: BTreeMap<String, Vec<ActionDoc>>,
    #[serde(default)]
    exception_handlers: Vec<HandlerDoc>,
    #[serde(default)]
    timers: Vec<TimerDoc>,
    action: Option<ActionDoc>,
    #[serde(default, rename = "async")]
    is_async: bool,

    // decision
    expression: Option<String>,
    default_transition: Option<String>,

    // join
    lock: Option<String>,
    #[serde(default)]
    discriminator: bool,
    tokens: Option<Vec<String>>,
    n_out_of_m: Option<usize>,

    // process-state
    sub_process: Option<String>,
    #[serde(default)]
    variables: Vec<MappingDoc>,

    // end
    #[serde(default)]
    end_complete_process: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransitionDoc {
    name: Option<String>,
    to: String,
    condition: Option<String>,
    #[serde(default)]
    actions: Vec<ActionDoc>,
    #[serde(default)]
    exception_handlers: Vec<HandlerDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimerDoc {
    name: String,
    due: String,
    repeat: Option<String>,
    transition: Option<String>,
    action: Option<ActionDoc>,
    calendar: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HandlerDoc {
    kind: Option<String>,
    #[serde(default)]
    actions: Vec<ActionDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingDoc {
    name: String,
    mapped_name: Option<String>,
    access: Option<String>,
}

/// An action reference: a bare handler name or a map with options.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActionDoc {
    Name(String),
    Detailed {
        handler: String,
        name: Option<String>,
        #[serde(default, rename = "async")]
        is_async: bool,
        #[serde(default = "default_propagation")]
        propagation: bool,
    },
}

fn default_propagation() -> bool {
    true
}

impl ActionDoc {
    fn resolve(&self, registry: &ActionRegistry) -> Result<Action, DefinitionError> {
        let (handler, name, is_async, propagation) = match self {
            Self::Name(handler) => (handler, None, false, true),
            Self::Detailed {
                handler,
                name,
                is_async,
                propagation,
            } => (handler, name.as_ref(), *is_async, *propagation),
        };

        let resolved = registry
            .get(handler)
            .ok_or_else(|| DefinitionError::UnknownAction(handler.clone()))?;

        Ok(Action::new(resolved)
            .named(name.unwrap_or(handler).clone())
            .asynchronous(is_async)
            .with_propagation(propagation))
    }
}

fn resolve_actions(docs: &[ActionDoc], registry: &ActionRegistry) -> Result<Vec<Action>, DefinitionError> {
    docs.iter().map(|doc| doc.resolve(registry)).collect()
}

fn resolve_handlers(
    docs: &[HandlerDoc],
    registry: &ActionRegistry,
) -> Result<Vec<ExceptionHandler>, DefinitionError> {
    let mut handlers = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut handler = match &doc.kind {
            Some(kind) => ExceptionHandler::new(kind.clone()),
            None => ExceptionHandler::catch_all(),
        };
        for action in resolve_actions(&doc.actions, registry)? {
            handler = handler.with_action(action);
        }
        handlers.push(handler);
    }
    Ok(handlers)
}

fn parse_access(access: &str) -> Result<(bool, bool), DefinitionError> {
    let mut read = false;
    let mut write = false;
    for part in access.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        match part {
            "read" => read = true,
            "write" => write = true,
            _ => return Err(DefinitionError::InvalidAccess(access.to_string())),
        }
    }
    if !read && !write {
        return Err(DefinitionError::InvalidAccess(access.to_string()));
    }
    Ok((read, write))
}

fn node_kind(doc: &NodeDoc) -> Result<NodeKind, DefinitionError> {
    let kind = match doc.node_type.as_str() {
        "start" => NodeKind::Start,
        "state" => NodeKind::State,
        "task-node" => NodeKind::TaskNode,
        "node" => NodeKind::Node,
        "fork" => NodeKind::Fork,
        "join" => NodeKind::Join(JoinConfig {
            lock_mode: doc.lock.as_deref().map(str::parse::<JoinLockMode>).transpose()?,
            discriminator: doc.discriminator,
            token_names: doc.tokens.clone(),
            n_out_of_m: doc.n_out_of_m,
        }),
        "decision" => NodeKind::Decision(DecisionConfig {
            handler: None,
            expression: doc.expression.as_deref().map(Expression::parse).transpose()?,
            default_transition: doc.default_transition.clone(),
        }),
        "process-state" => {
            let definition = doc.sub_process.clone().ok_or_else(|| {
                DefinitionError::Invalid(format!("process-state '{}' needs a sub_process", doc.name))
            })?;
            let mut config = SubProcessConfig::new(definition);
            for mapping in &doc.variables {
                let (read, write) = match &mapping.access {
                    Some(access) => parse_access(access)?,
                    None => (true, true),
                };
                let mut variable = VariableMapping::new(mapping.name.clone()).with_access(read, write);
                if let Some(mapped) = &mapping.mapped_name {
                    variable = variable.with_mapped_name(mapped.clone());
                }
                config = config.with_mapping(variable);
            }
            NodeKind::ProcessState(config)
        }
        "end" => NodeKind::End {
            end_complete_process: doc.end_complete_process,
        },
        other => return Err(DefinitionError::UnknownNodeType(other.to_string())),
    };
    Ok(kind)
}

fn timer_spec(doc: &TimerDoc, registry: &ActionRegistry) -> Result<TimerSpec, DefinitionError> {
    let mut spec = TimerSpec::new(doc.name.clone(), doc.due.clone())?;
    if let Some(repeat) = &doc.repeat {
        spec = spec.with_repeat(repeat.clone())?;
    }
    if let Some(transition) = &doc.transition {
        spec = spec.with_transition(transition.clone());
    }
    if let Some(action) = &doc.action {
        spec = spec.with_action(action.resolve(registry)?);
    }
    if let Some(calendar) = &doc.calendar {
        spec = spec.with_calendar(calendar.clone());
    }
    Ok(spec)
}

/// Builds a definition from YAML text and validates it.
pub fn parse_definition(yaml: &str, registry: &ActionRegistry) -> Result<ProcessDefinition, DefinitionError> {
    let doc: DefinitionDoc = serde_yaml::from_str(yaml)?;
    debug!("Parsed definition '{}' with {} nodes", doc.name, doc.nodes.len());

    let mut definition = ProcessDefinition::new(doc.name.clone());

    // Nodes first so transitions can refer forward.
    let mut ids = Vec::with_capacity(doc.nodes.len());
    for node_doc in &doc.nodes {
        let id = definition.add_node(node_doc.name.clone(), node_kind(node_doc)?)?;
        let node = definition.node_mut(id)?;
        node.is_async = node_doc.is_async;
        node.action = node_doc.action.as_ref().map(|a| a.resolve(registry)).transpose()?;
        node.timers = node_doc
            .timers
            .iter()
            .map(|timer| timer_spec(timer, registry))
            .collect::<Result<_, _>>()?;
        node.exception_handlers = resolve_handlers(&node_doc.exception_handlers, registry)?;
        ids.push(id);
    }

    for (node_doc, &from) in doc.nodes.iter().zip(&ids) {
        for (event, actions) in &node_doc.events {
            let event: EventType = event.parse().unwrap_or_else(|never| match never {});
            for action in resolve_actions(actions, registry)? {
                definition.add_event_action(GraphElement::Node(from), event.clone(), action)?;
            }
        }

        for transition_doc in &node_doc.transitions {
            let to = definition
                .node_by_name(&transition_doc.to)
                .map(|node| node.id)
                .ok_or_else(|| DefinitionError::UnknownNode(transition_doc.to.clone()))?;
            let id = definition.add_transition(from, to, transition_doc.name.as_deref())?;

            let transition = definition.transition_mut(id)?;
            transition.condition = transition_doc
                .condition
                .as_deref()
                .map(Expression::parse)
                .transpose()?;
            transition.actions = resolve_actions(&transition_doc.actions, registry)?;
            transition.exception_handlers = resolve_handlers(&transition_doc.exception_handlers, registry)?;
        }
    }

    for (event, actions) in &doc.events {
        let event: EventType = event.parse().unwrap_or_else(|never| match never {});
        for action in resolve_actions(actions, registry)? {
            definition.add_event_action(GraphElement::Process, event.clone(), action)?;
        }
    }
    for handler in resolve_handlers(&doc.exception_handlers, registry)? {
        definition.add_exception_handler(GraphElement::Process, handler)?;
    }

    validate_definition(&definition)?;

    info!(
        "Loaded process definition '{}': {} nodes, {} transitions",
        definition.name(),
        definition.nodes().len(),
        definition.transitions().len()
    );
    Ok(definition)
}

/// Reads and parses a definition file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::graph::{load_definition, ActionRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("approval.yaml", &ActionRegistry::with_builtins())?;
///     println!("Loaded {} nodes", definition.nodes().len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: &str, registry: &ActionRegistry) -> Result<ProcessDefinition, DefinitionError> {
    info!("Loading process definition from: {}", path);

    let yaml = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_string(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_definition(&yaml, registry)
}
