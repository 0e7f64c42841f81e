//! Node Behaviours
//!
//! What a token does once it has entered a node. Wait nodes return to the
//! caller; the others continue traversal within the same call.

use log::{debug, warn};

use super::context::{ExecutionContext, Trigger};
use super::engine::ProcessEngine;
use super::instance::{ProcessInstance, SuperProcessToken};
use super::token::{TokenId, ROOT_TOKEN};
use crate::error::EngineError;
use crate::graph::{DecisionConfig, EventType, GraphElement, JoinConfig, NodeId, NodeKind, SubProcessConfig};
use crate::services::LogEvent;

const NO_CONDITION_MATCHED: &str = "no condition matched";

impl ProcessEngine {
    pub(crate) fn execute_node(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let current = definition.node(node);

        match &current.kind {
            NodeKind::Start | NodeKind::State | NodeKind::TaskNode => {
                debug!("Token {} waits in '{}'", instance.token_name(token), current.name);
                Ok(())
            }
            NodeKind::Node => match &current.action {
                Some(action) => {
                    let trigger = Trigger {
                        event_source: Some(GraphElement::Node(node)),
                        ..Trigger::token(token)
                    };
                    self.execute_action(instance, action, GraphElement::Node(node), trigger)
                }
                None => self.leave_default(instance, token),
            },
            NodeKind::Fork => self.fork(instance, token, node),
            NodeKind::Join(config) => self.join(instance, token, node, config),
            NodeKind::Decision(config) => self.decide(instance, token, node, config),
            NodeKind::ProcessState(config) => self.spawn_sub_process(instance, token, node, config),
            NodeKind::End {
                end_complete_process: true,
            } => self.end_instance(instance),
            NodeKind::End { .. } => self.end_token(instance, token, true),
        }
    }

    /// Creates one child per leaving transition, then moves each child over
    /// its transition in declaration order.
    fn fork(&self, instance: &mut ProcessInstance, token: TokenId, node: NodeId) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let now = self.now();

        let mut children = Vec::new();
        for &transition in definition.node(node).leaving() {
            let name = definition.transition(transition).name.as_deref();
            let child = instance
                .tokens_mut()
                .create_child(token, name, node, now)
                .ok_or(EngineError::UnknownToken(token))?;
            let child_name = instance.token_name(child);
            self.log(instance, token, LogEvent::TokenCreate { name: child_name });
            children.push((child, transition));
        }

        for (child, transition) in children {
            if !instance.token(child)?.has_ended() {
                self.leave(instance, child, transition)?;
            }
        }
        Ok(())
    }

    /// Ends the arriving child and releases the parent once the join's
    /// policy is satisfied. The root token passes straight through.
    fn join(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
        config: &JoinConfig,
    ) -> Result<(), EngineError> {
        let (parent, able) = {
            let arriving = instance.token(token)?;
            (arriving.parent, arriving.able_to_reactivate_parent)
        };
        let parent = match parent {
            Some(parent) => parent,
            None => return self.leave_default(instance, token),
        };

        self.end_token(instance, token, false)?;
        if !able {
            return Ok(());
        }
        instance.token_mut(token)?.able_to_reactivate_parent = false;

        let lock_mode = config.lock_mode.unwrap_or(self.config().join_lock_mode);
        self.services()
            .persistence()
            .lock_token(instance, parent, lock_mode)?;

        let tokens = instance.tokens();
        let children = tokens.children_of(parent);
        let arrived = |child: TokenId| {
            tokens
                .get(child)
                .map_or(false, |child| !child.able_to_reactivate_parent)
        };

        let reactivate = if config.discriminator {
            true
        } else if let Some(names) = &config.token_names {
            names.iter().all(|name| {
                tokens
                    .child(parent, name)
                    .map_or(false, |child| arrived(child))
            })
        } else if let Some(n) = config.n_out_of_m {
            let at_join = children
                .iter()
                .filter(|&&child| tokens.get(child).map_or(false, |child| child.node == node))
                .count();
            at_join >= n
        } else {
            children.iter().all(|&child| arrived(child))
        };

        if !reactivate {
            debug!(
                "Join '{}' waits for siblings of {}",
                instance.definition().node(node).name,
                instance.token_name(token)
            );
            return Ok(());
        }

        for child in children {
            instance.token_mut(child)?.able_to_reactivate_parent = false;
        }
        let name = instance.definition().node(node).name.clone();
        self.log(instance, parent, LogEvent::JoinReleased { node: name });

        let now = self.now();
        let parent_token = instance.token_mut(parent)?;
        parent_token.node = node;
        parent_token.node_enter = now;
        self.leave_default(instance, parent)
    }

    /// Picks the leaving transition: handler, then expression, then the
    /// first transition whose condition holds. A value without a matching
    /// transition falls back to the default transition.
    fn decide(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
        config: &DecisionConfig,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let current = definition.node(node);
        let default_transition = || {
            config
                .default_transition
                .as_deref()
                .and_then(|name| definition.leaving_transition(node, name))
        };

        let value = if let Some(handler) = &config.handler {
            let trigger = Trigger {
                event_source: Some(GraphElement::Node(node)),
                ..Trigger::token(token)
            };
            let decided = {
                let ctx = ExecutionContext::new(self, instance, trigger.clone());
                handler.decide(&ctx)
            };
            match decided {
                Ok(value) => Some(value),
                Err(error) => {
                    let label = format!("decision handler of '{}'", current.name);
                    return self.raise_exception(instance, trigger, GraphElement::Node(node), label, error);
                }
            }
        } else {
            config.expression.as_ref().map(|expression| {
                expression
                    .evaluate(|name| instance.variable(token, name).ok().flatten())
                    .to_string()
            })
        };

        let transition = match value {
            Some(value) => definition
                .leaving_transition(node, &value)
                .or_else(default_transition)
                .ok_or_else(|| EngineError::DecisionNoMatch {
                    node: current.name.clone(),
                    value,
                })?,
            None => {
                let lookup = |name: &str| instance.variable(token, name).ok().flatten();
                current
                    .leaving()
                    .iter()
                    .copied()
                    .find(|&id| {
                        definition
                            .transition(id)
                            .condition
                            .as_ref()
                            .map_or(false, |condition| condition.is_true(&lookup))
                    })
                    .or_else(default_transition)
                    .or_else(|| {
                        current
                            .leaving()
                            .iter()
                            .copied()
                            .find(|&id| definition.transition(id).condition.is_none())
                    })
                    .ok_or_else(|| EngineError::DecisionNoMatch {
                        node: current.name.clone(),
                        value: NO_CONDITION_MATCHED.to_string(),
                    })?
            }
        };

        debug!(
            "Decision '{}' takes {}",
            current.name,
            definition.element_name(GraphElement::Transition(transition))
        );
        self.leave(instance, token, transition)
    }

    /// Starts the sub-process and copies readable variables into it. A
    /// sub-process that ends right away completes this token immediately.
    fn spawn_sub_process(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
        config: &SubProcessConfig,
    ) -> Result<(), EngineError> {
        let sub_definition = self
            .services()
            .persistence()
            .find_definition(&config.definition)
            .ok_or_else(|| EngineError::UnknownDefinition(config.definition.clone()))?;

        let super_token = SuperProcessToken {
            instance: instance.id(),
            token,
        };
        let mut child = self.create_instance(sub_definition, Some(super_token), instance.defers_jobs())?;
        let child_id = child.id();

        instance.token_mut(token)?.sub_process_instance = Some(child_id);
        self.fire_event(
            instance,
            Trigger::event(token, GraphElement::Node(node), EventType::SubprocessCreated)
                .with_sub_process(Some(child_id)),
        )?;
        self.log(instance, token, LogEvent::SubProcessCreated { instance: child_id });

        for mapping in config.variables.iter().filter(|mapping| mapping.read) {
            if let Some(value) = instance.variable(token, &mapping.name)? {
                self.set_variable(&mut child, ROOT_TOKEN, &mapping.mapped_name, value)?;
            }
        }

        self.signal_internal(&mut child, ROOT_TOKEN, None, None)?;
        if child.has_ended() {
            child.set_super_notified();
            self.complete_sub_process(instance, token, &child)?;
        }
        instance.push_cascade(child);
        Ok(())
    }

    /// Copies writable variables back out of an ended sub-process and
    /// moves the waiting token on.
    pub(crate) fn complete_sub_process(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        child: &ProcessInstance,
    ) -> Result<(), EngineError> {
        let waiting = instance.token(token)?;
        if waiting.has_ended() || waiting.sub_process_instance != Some(child.id()) {
            warn!(
                "Token {} of instance {} is not waiting for sub-process {}",
                instance.token_name(token),
                instance.id(),
                child.id()
            );
            return Ok(());
        }
        let node = waiting.node;

        let definition = instance.definition_arc();
        if let NodeKind::ProcessState(config) = &definition.node(node).kind {
            for mapping in config.variables.iter().filter(|mapping| mapping.write) {
                if let Some(value) = child.variable(ROOT_TOKEN, &mapping.mapped_name)? {
                    self.set_variable(instance, token, &mapping.name, value)?;
                }
            }
        }

        self.fire_event(
            instance,
            Trigger::event(token, GraphElement::Node(node), EventType::SubprocessEnd)
                .with_sub_process(Some(child.id())),
        )?;
        instance.token_mut(token)?.sub_process_instance = None;
        self.log(instance, token, LogEvent::SubProcessEnd { instance: child.id() });

        self.leave_default(instance, token)
    }
}
