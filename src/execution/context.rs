//! Execution Context
//!
//! The transient view handed to actions and decision handlers while a token
//! is being moved. It is created per traversal step and never stored.

use chrono::NaiveDateTime;

use super::engine::ProcessEngine;
use super::instance::{InstanceId, ProcessInstance};
use super::token::{Token, TokenId};
use crate::error::{ActionError, EngineError};
use crate::graph::{Action, EventType, GraphElement, Node, TimerSpec, Transition, TransitionId};
use crate::jobs::Timer;
use crate::variables::{VariableError, VariableValue};

/// What started the current traversal step.
#[derive(Debug, Clone, Default)]
pub(crate) struct Trigger {
    pub token: TokenId,
    pub event_source: Option<GraphElement>,
    pub event: Option<EventType>,
    pub transition: Option<TransitionId>,
    pub timer: Option<Timer>,
    pub sub_process_instance: Option<InstanceId>,
}

impl Trigger {
    pub fn token(token: TokenId) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn event(token: TokenId, element: GraphElement, event: EventType) -> Self {
        Self {
            token,
            event_source: Some(element),
            event: Some(event),
            ..Self::default()
        }
    }

    pub fn with_transition(mut self, transition: Option<TransitionId>) -> Self {
        self.transition = transition;
        self
    }

    pub fn with_timer(mut self, timer: Option<Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_sub_process(mut self, instance: Option<InstanceId>) -> Self {
        self.sub_process_instance = instance;
        self
    }
}

/// Traversal state visible to user code.
pub struct ExecutionContext<'a> {
    engine: &'a ProcessEngine,
    instance: &'a mut ProcessInstance,
    trigger: Trigger,
    action: Option<Action>,
    exception: Option<ActionError>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(engine: &'a ProcessEngine, instance: &'a mut ProcessInstance, trigger: Trigger) -> Self {
        Self {
            engine,
            instance,
            trigger,
            action: None,
            exception: None,
        }
    }

    pub(crate) fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub(crate) fn with_exception(mut self, exception: ActionError) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn engine(&self) -> &ProcessEngine {
        self.engine
    }

    pub fn instance(&self) -> &ProcessInstance {
        self.instance
    }

    pub fn instance_mut(&mut self) -> &mut ProcessInstance {
        self.instance
    }

    pub fn now(&self) -> NaiveDateTime {
        self.engine.now()
    }

    pub fn token_id(&self) -> TokenId {
        self.trigger.token
    }

    pub fn token(&self) -> Option<&Token> {
        self.instance.tokens().get(self.trigger.token)
    }

    /// Full name of the token, e.g. `/left`.
    pub fn token_name(&self) -> String {
        self.instance.token_name(self.trigger.token)
    }

    /// Node the token currently sits on.
    pub fn node(&self) -> Option<&Node> {
        let token = self.token()?;
        self.instance.definition().nodes().get(token.node)
    }

    pub fn node_name(&self) -> Option<String> {
        self.node().map(|node| node.name.clone())
    }

    pub fn event(&self) -> Option<&EventType> {
        self.trigger.event.as_ref()
    }

    /// Element the current event was fired on.
    pub fn event_source(&self) -> Option<GraphElement> {
        self.trigger.event_source
    }

    /// Transition being taken, during leave/transition/enter events.
    pub fn transition(&self) -> Option<&Transition> {
        let id = self.trigger.transition?;
        self.instance.definition().transitions().get(id)
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    /// Failure being handled, inside exception handler actions.
    pub fn exception(&self) -> Option<&ActionError> {
        self.exception.as_ref()
    }

    pub fn timer(&self) -> Option<&Timer> {
        self.trigger.timer.as_ref()
    }

    pub fn sub_process_instance(&self) -> Option<InstanceId> {
        self.trigger.sub_process_instance
    }

    pub fn variable(&self, name: &str) -> Result<Option<VariableValue>, VariableError> {
        self.instance.variable(self.trigger.token, name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.instance.has_variable(self.trigger.token, name)
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<(), EngineError> {
        self.engine
            .set_variable(self.instance, self.trigger.token, name, value.into())
    }

    /// Removes the nearest visible definition of `name`.
    pub fn delete_variable(&mut self, name: &str) -> Result<bool, EngineError> {
        self.engine.delete_variable(self.instance, self.trigger.token, name)
    }

    /// Leaves the current node over its default transition.
    pub fn leave_node(&mut self) -> Result<(), EngineError> {
        self.engine.leave_default(self.instance, self.trigger.token)
    }

    pub fn leave_node_by(&mut self, transition: &str) -> Result<(), EngineError> {
        let token = self.trigger.token;
        let node = self.instance.token(token)?.node;
        let definition = self.instance.definition_arc();
        let transition = definition
            .leaving_transition(node, transition)
            .ok_or_else(|| EngineError::UnknownTransition {
                node: definition.node(node).name.clone(),
                transition: transition.to_string(),
            })?;
        self.engine.leave(self.instance, token, transition)
    }

    /// Creates a timer for this token, firing on the current node.
    pub fn schedule_timer(&mut self, spec: &TimerSpec) -> Result<(), EngineError> {
        let token = self.trigger.token;
        let node = self.instance.token(token)?.node;
        self.engine
            .create_timer(self.instance, token, GraphElement::Node(node), spec)
    }

    /// Cancels this token's timers called `name`; the count is `None` while
    /// the instance defers jobs.
    pub fn cancel_timer(&mut self, name: &str) -> Result<Option<usize>, EngineError> {
        self.engine.cancel_timer(self.instance, self.trigger.token, name)
    }
}
