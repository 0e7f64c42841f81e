//! Process Definition Validation
//!
//! Structural checks run on every loaded definition:
//! - Exactly one start node
//! - Unique node names and unique transition names per node
//! - Transitions that stay inside the definition
//! - Forks and decisions with somewhere to go
//! - Default and timer transitions that exist

use std::collections::{HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{NodeKind, ProcessDefinition};
use super::DefinitionError;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyDefinition,
    NoStartNode,
    MultipleStartNodes(Vec<String>),
    EmptyNodeName,
    DuplicateNode(String),
    DuplicateTransition { node: String, transition: String },
    DanglingTransition { node: String, target: usize },
    NoLeavingTransitions { node: String, kind: &'static str },
    UnknownDefaultTransition { node: String, transition: String },
    UnknownTimerTransition { node: String, timer: String, transition: String },
    EmptyJoinTokens(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDefinition => write!(f, "Process definition has no nodes"),
            Self::NoStartNode => write!(f, "Process definition has no start node"),
            Self::MultipleStartNodes(names) => {
                write!(f, "Process definition has several start nodes: {}", names.join(", "))
            }
            Self::EmptyNodeName => write!(f, "A node has an empty or whitespace-only name"),
            Self::DuplicateNode(name) => write!(f, "Duplicate node name: '{}'", name),
            Self::DuplicateTransition { node, transition } => {
                write!(f, "Node '{}' has two leaving transitions named '{}'", node, transition)
            }
            Self::DanglingTransition { node, target } => {
                write!(f, "Node '{}' has a transition to unknown node #{}", node, target)
            }
            Self::NoLeavingTransitions { node, kind } => {
                write!(f, "{} '{}' has no leaving transitions", kind, node)
            }
            Self::UnknownDefaultTransition { node, transition } => {
                write!(f, "Decision '{}' defaults to unknown transition '{}'", node, transition)
            }
            Self::UnknownTimerTransition { node, timer, transition } => write!(
                f,
                "Timer '{}' on node '{}' takes unknown transition '{}'",
                timer, node, transition
            ),
            Self::EmptyJoinTokens(node) => write!(f, "Join '{}' waits for an empty token list", node),
        }
    }
}

/// Validates the whole definition, collecting every error into one message.
pub fn validate_definition(definition: &ProcessDefinition) -> Result<(), DefinitionError> {
    info!(
        "Validating process definition '{}' with {} nodes",
        definition.name(),
        definition.nodes().len()
    );

    let errors = collect_errors(definition);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(DefinitionError::Invalid(messages.join("\n")));
    }

    for name in unreachable_nodes(definition) {
        warn!("Node '{}' is not reachable from the start node", name);
    }

    debug!("Process definition '{}' validated", definition.name());
    Ok(())
}

fn collect_errors(definition: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let nodes = definition.nodes();

    if nodes.is_empty() {
        errors.push(ValidationError::EmptyDefinition);
        return errors;
    }

    let starts: Vec<String> = nodes
        .iter()
        .filter(|node| matches!(node.kind, NodeKind::Start))
        .map(|node| node.name.clone())
        .collect();
    match starts.len() {
        0 => errors.push(ValidationError::NoStartNode),
        1 => {}
        _ => errors.push(ValidationError::MultipleStartNodes(starts)),
    }

    let mut seen_names = HashSet::new();
    for node in nodes {
        if node.name.trim().is_empty() {
            errors.push(ValidationError::EmptyNodeName);
        } else if !seen_names.insert(node.name.as_str()) {
            errors.push(ValidationError::DuplicateNode(node.name.clone()));
        }

        let mut seen_transitions = HashSet::new();
        for &id in node.leaving() {
            let transition = definition.transition(id);
            if transition.to >= nodes.len() {
                errors.push(ValidationError::DanglingTransition {
                    node: node.name.clone(),
                    target: transition.to,
                });
            }
            if let Some(name) = &transition.name {
                if !seen_transitions.insert(name.as_str()) {
                    errors.push(ValidationError::DuplicateTransition {
                        node: node.name.clone(),
                        transition: name.clone(),
                    });
                }
            }
        }

        match &node.kind {
            NodeKind::Fork | NodeKind::Decision(_) if node.leaving().is_empty() => {
                errors.push(ValidationError::NoLeavingTransitions {
                    node: node.name.clone(),
                    kind: node.kind.type_name(),
                });
            }
            _ => {}
        }

        if let NodeKind::Decision(config) = &node.kind {
            if let Some(default) = &config.default_transition {
                if definition.leaving_transition(node.id, default).is_none() {
                    errors.push(ValidationError::UnknownDefaultTransition {
                        node: node.name.clone(),
                        transition: default.clone(),
                    });
                }
            }
        }

        if let NodeKind::Join(config) = &node.kind {
            if config.token_names.as_ref().map_or(false, Vec::is_empty) {
                errors.push(ValidationError::EmptyJoinTokens(node.name.clone()));
            }
        }

        for timer in &node.timers {
            if let Some(transition) = &timer.transition {
                if definition.leaving_transition(node.id, transition).is_none() {
                    errors.push(ValidationError::UnknownTimerTransition {
                        node: node.name.clone(),
                        timer: timer.name.clone(),
                        transition: transition.clone(),
                    });
                }
            }
        }
    }

    errors
}

/// Names of nodes no path from the start node reaches.
fn unreachable_nodes(definition: &ProcessDefinition) -> Vec<String> {
    let Some(start) = definition.start_node() else {
        return Vec::new();
    };

    let mut visited = vec![false; definition.nodes().len()];
    let mut queue = VecDeque::from([start.id]);
    visited[start.id] = true;

    while let Some(current) = queue.pop_front() {
        for &id in definition.node(current).leaving() {
            let target = definition.transition(id).to;
            if !visited[target] {
                visited[target] = true;
                queue.push_back(target);
            }
        }
    }

    definition
        .nodes()
        .iter()
        .filter(|node| !visited[node.id])
        .map(|node| node.name.clone())
        .collect()
}
