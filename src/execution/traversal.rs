//! Token Traversal
//!
//! Moving tokens along transitions, firing events, running actions and
//! routing their failures to exception handlers. A leave runs, in order:
//! `node-leave` actions, timer cancellation, `transition` actions, the
//! move itself, `node-enter` actions, timer creation and finally the
//! behaviour of the entered node.

use log::{debug, info};

use super::context::{ExecutionContext, Trigger};
use super::engine::ProcessEngine;
use super::instance::{InstanceId, ProcessInstance};
use super::token::{TokenId, ROOT_TOKEN};
use crate::error::{ActionError, EngineError};
use crate::graph::{Action, EventType, GraphElement, NodeId, TransitionId};
use crate::jobs::{Job, JobKind};
use crate::services::{DeferredOperation, LogEvent};

impl ProcessEngine {
    pub(crate) fn signal_internal(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: Option<&str>,
        owner: Option<&str>,
    ) -> Result<(), EngineError> {
        check_signalable(instance, token, owner)?;

        let definition = instance.definition_arc();
        let node = instance.token(token)?.node;
        let transition = match transition {
            Some(name) => definition
                .leaving_transition(node, name)
                .ok_or_else(|| EngineError::UnknownTransition {
                    node: definition.node(node).name.clone(),
                    transition: name.to_string(),
                })?,
            None => definition.default_leaving_transition(node)?,
        };

        debug!(
            "Signal on token {} at '{}'",
            instance.token_name(token),
            definition.node(node).name
        );
        self.log(
            instance,
            token,
            LogEvent::Signal {
                transition: definition.transition(transition).name.clone(),
            },
        );

        let element = GraphElement::Node(node);
        self.fire_event(
            instance,
            Trigger::event(token, element, EventType::BeforeSignal).with_transition(Some(transition)),
        )?;
        self.leave(instance, token, transition)?;
        self.fire_event(
            instance,
            Trigger::event(token, element, EventType::AfterSignal).with_transition(Some(transition)),
        )
    }

    /// Leaves the token's node over its single leaving transition.
    pub(crate) fn leave_default(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<(), EngineError> {
        let node = instance.token(token)?.node;
        let transition = instance.definition().default_leaving_transition(node)?;
        self.leave(instance, token, transition)
    }

    pub(crate) fn leave(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: TransitionId,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let from = definition.transition(transition).from;
        instance.token_mut(token)?.node = from;

        self.fire_event(
            instance,
            Trigger::event(token, GraphElement::Node(from), EventType::NodeLeave).with_transition(Some(transition)),
        )?;
        self.cancel_node_timers(instance, token, from)?;
        self.log(
            instance,
            token,
            LogEvent::NodeLeave {
                node: definition.node(from).name.clone(),
            },
        );

        self.take(instance, token, transition)
    }

    fn take(&self, instance: &mut ProcessInstance, token: TokenId, transition: TransitionId) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let element = GraphElement::Transition(transition);
        self.log(
            instance,
            token,
            LogEvent::TransitionTaken {
                transition: definition.element_name(element),
            },
        );
        self.fire_event(
            instance,
            Trigger::event(token, element, EventType::Transition).with_transition(Some(transition)),
        )?;

        self.enter(instance, token, definition.transition(transition).to, Some(transition))
    }

    pub(crate) fn enter(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
        via: Option<TransitionId>,
    ) -> Result<(), EngineError> {
        let now = self.now();
        {
            let token = instance.token_mut(token)?;
            token.node = node;
            token.node_enter = now;
        }

        let definition = instance.definition_arc();
        self.fire_event(
            instance,
            Trigger::event(token, GraphElement::Node(node), EventType::NodeEnter).with_transition(via),
        )?;
        self.log(
            instance,
            token,
            LogEvent::NodeEnter {
                node: definition.node(node).name.clone(),
            },
        );
        self.create_node_timers(instance, token, node)?;

        if definition.node(node).is_async {
            self.send_continuation(instance, token, node)
        } else {
            self.execute_node(instance, token, node)
        }
    }

    /// Runs the actions registered for the trigger's event on its source
    /// element and on every enclosing element.
    pub(crate) fn fire_event(&self, instance: &mut ProcessInstance, trigger: Trigger) -> Result<(), EngineError> {
        let (element, event) = match (trigger.event_source, trigger.event.clone()) {
            (Some(element), Some(event)) => (element, event),
            _ => return Ok(()),
        };

        let definition = instance.definition_arc();
        for (depth, current) in definition.element_chain(element).into_iter().enumerate() {
            for action in definition.event_actions(current, &event) {
                if depth > 0 && !action.propagation_allowed() {
                    continue;
                }
                self.execute_action(instance, action, current, trigger.clone())?;
            }
        }
        Ok(())
    }

    /// Runs `action` inline, or sends it as a job when it is asynchronous.
    pub(crate) fn execute_action(
        &self,
        instance: &mut ProcessInstance,
        action: &Action,
        element: GraphElement,
        trigger: Trigger,
    ) -> Result<(), EngineError> {
        if !action.is_async() {
            return self.run_action(instance, action, element, trigger);
        }

        let job = Job::new(
            instance.id(),
            trigger.token,
            self.now(),
            JobKind::ExecuteAction {
                action: action.clone(),
                element,
                event: trigger.event,
            },
        );
        self.dispatch(instance, DeferredOperation::Send(job))?;
        debug!("Action {} handed to a job", action.label());
        Ok(())
    }

    pub(crate) fn run_action(
        &self,
        instance: &mut ProcessInstance,
        action: &Action,
        element: GraphElement,
        trigger: Trigger,
    ) -> Result<(), EngineError> {
        let token = trigger.token;
        let result = {
            let mut ctx = ExecutionContext::new(self, instance, trigger.clone()).with_action(action.clone());
            action.execute(&mut ctx)
        };

        match result {
            Ok(()) => {
                self.log(instance, token, LogEvent::ActionExecuted { action: action.label() });
                Ok(())
            }
            Err(error) => {
                self.log(
                    instance,
                    token,
                    LogEvent::ActionFailed {
                        action: action.label(),
                        error: error.to_string(),
                    },
                );
                self.raise_exception(instance, trigger, element, action.label(), error)
            }
        }
    }

    /// Offers a failure to the exception handlers from `element` outwards.
    ///
    /// Stale-version failures bypass handlers so the unit of work can be
    /// retried as a whole.
    pub(crate) fn raise_exception(
        &self,
        instance: &mut ProcessInstance,
        trigger: Trigger,
        element: GraphElement,
        label: String,
        error: ActionError,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        let unhandled = |source: ActionError| EngineError::Action {
            element: definition.element_name(element),
            action: label.clone(),
            source,
        };

        if error.engine_cause().map_or(false, EngineError::is_stale_version) {
            return Err(unhandled(error));
        }

        for current in definition.element_chain(element) {
            let handler = definition
                .exception_handlers(current)
                .iter()
                .find(|handler| handler.matches(&error.kind));

            if let Some(handler) = handler {
                debug!(
                    "{} handles '{}' raised by {}",
                    definition.element_name(current),
                    error.kind,
                    label
                );
                for action in handler.actions() {
                    let mut ctx = ExecutionContext::new(self, instance, trigger.clone())
                        .with_action(action.clone())
                        .with_exception(error.clone());
                    action.execute(&mut ctx).map_err(|source| EngineError::Action {
                        element: definition.element_name(current),
                        action: action.label(),
                        source,
                    })?;
                }
                self.log(
                    instance,
                    trigger.token,
                    LogEvent::ExceptionHandled {
                        element: definition.element_name(current),
                        kind: error.kind.clone(),
                    },
                );
                return Ok(());
            }
        }

        Err(unhandled(error))
    }

    /// Ends `token` and its children.
    ///
    /// With `verify_parent`, a parent left without active children ends
    /// too, and an ended root ends the instance.
    pub(crate) fn end_token(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        verify_parent: bool,
    ) -> Result<(), EngineError> {
        if instance.token(token)?.has_ended() {
            return Ok(());
        }
        instance.token_mut(token)?.end = Some(self.now());

        for child in instance.tokens().children_of(token) {
            self.end_token(instance, child, false)?;
        }
        if let Some(sub_process) = instance.token(token)?.sub_process_instance {
            self.end_sub_process(instance, sub_process)?;
        }
        if token != ROOT_TOKEN {
            self.log(instance, token, LogEvent::TokenEnd);
        }

        if verify_parent {
            match instance.token(token)?.parent {
                None => self.end_instance(instance)?,
                Some(parent) => {
                    if !instance.tokens().has_active_children(parent) {
                        self.end_token(instance, parent, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn end_sub_process(&self, instance: &mut ProcessInstance, sub_process: InstanceId) -> Result<(), EngineError> {
        match instance.cascade().iter().position(|child| child.id() == sub_process) {
            Some(index) => {
                let child = &mut instance.cascade_mut()[index];
                child.set_super_notified();
                self.end_instance(child)
            }
            None => {
                let mut child = self.services().persistence().load(sub_process)?;
                if instance.defers_jobs() {
                    child.defer_jobs();
                }
                child.set_super_notified();
                self.end_instance(&mut child)?;
                instance.push_cascade(child);
                Ok(())
            }
        }
    }

    /// Ends every token, fires `process-end` and cancels pending timers.
    pub(crate) fn end_instance(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        if instance.has_ended() {
            return Ok(());
        }
        instance.set_end(self.now());
        self.end_token(instance, ROOT_TOKEN, false)?;

        self.fire_event(
            instance,
            Trigger::event(ROOT_TOKEN, GraphElement::Process, EventType::ProcessEnd),
        )?;
        self.log(instance, ROOT_TOKEN, LogEvent::ProcessEnd);

        self.dispatch(instance, DeferredOperation::DeleteTimersByProcessInstance(instance.id()))?;
        info!("Process instance {} ended", instance.id());
        Ok(())
    }
}

fn check_signalable(instance: &ProcessInstance, token: TokenId, owner: Option<&str>) -> Result<(), EngineError> {
    if instance.has_ended() {
        return Err(EngineError::InstanceEnded(instance.id()));
    }
    if instance.is_suspended() {
        return Err(EngineError::InstanceSuspended(instance.id()));
    }

    let current = instance.token(token)?;
    if current.has_ended() {
        return Err(EngineError::TokenEnded(instance.token_name(token)));
    }
    if current.suspended {
        return Err(EngineError::TokenSuspended(instance.token_name(token)));
    }
    if let Some(lock_owner) = current.lock_owner() {
        if owner != Some(lock_owner) {
            return Err(EngineError::TokenLocked {
                token: instance.token_name(token),
                owner: lock_owner.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::tests::{harness, three_nodes};
    use crate::graph::{ExceptionHandler, NodeKind, ProcessDefinition};
    use crate::variables::VariableValue;
    use std::sync::{Arc, Mutex};

    fn recorder(events: &Arc<Mutex<Vec<String>>>, label: &str) -> Action {
        let events = Arc::clone(events);
        let label = label.to_string();
        Action::from_fn(move |_ctx| {
            events.lock().unwrap().push(label.clone());
            Ok(())
        })
    }

    #[test]
    fn test_default_transition_errors() {
        let h = harness();
        let mut definition = ProcessDefinition::new("branching");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        let wait = definition.add_node("wait", NodeKind::State).unwrap();
        let a = definition.add_node("a", NodeKind::State).unwrap();
        let b = definition.add_node("b", NodeKind::State).unwrap();
        definition.add_transition(start, wait, None).unwrap();
        definition.add_transition(wait, a, Some("to-a")).unwrap();
        definition.add_transition(wait, b, Some("to-b")).unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();

        assert!(matches!(
            h.engine.signal(&mut instance),
            Err(EngineError::AmbiguousTransition { count: 2, .. })
        ));
        assert!(matches!(
            h.engine.signal_transition(&mut instance, ROOT_TOKEN, "to-c"),
            Err(EngineError::UnknownTransition { .. })
        ));

        h.engine.signal_transition(&mut instance, ROOT_TOKEN, "to-b").unwrap();
        assert_eq!(instance.root_token().node, b);

        let err = h.engine.signal(&mut instance).unwrap_err();
        assert!(matches!(err, EngineError::NoLeavingTransition { .. }));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_locked_token_only_accepts_its_owner() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();
        h.engine.lock(&mut instance, ROOT_TOKEN, "X").unwrap();

        let err = h
            .engine
            .signal_as(&mut instance, ROOT_TOKEN, None, Some("Y"))
            .unwrap_err();
        assert!(err.to_string().contains("'X'"));
        assert!(h.engine.signal(&mut instance).is_err());

        h.engine
            .signal_as(&mut instance, ROOT_TOKEN, None, Some("X"))
            .unwrap();
        assert_eq!(instance.root_token().node, 1);

        h.engine.unlock(&mut instance, ROOT_TOKEN, "X").unwrap();
        h.engine.signal_as(&mut instance, ROOT_TOKEN, None, Some("Y")).unwrap();
        assert!(instance.has_ended());
    }

    #[test]
    fn test_force_unlock_ignores_owner() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();
        h.engine.lock(&mut instance, ROOT_TOKEN, "X").unwrap();
        assert!(h.engine.unlock(&mut instance, ROOT_TOKEN, "Y").is_err());

        h.engine.force_unlock(&mut instance, ROOT_TOKEN).unwrap();
        h.engine.signal(&mut instance).unwrap();
    }

    #[test]
    fn test_suspended_instance_rejects_signals() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();

        h.engine.suspend(&mut instance).unwrap();
        assert!(instance.root_token().suspended);
        assert!(matches!(
            h.engine.signal(&mut instance),
            Err(EngineError::InstanceSuspended(_))
        ));

        h.engine.resume(&mut instance).unwrap();
        h.engine.signal(&mut instance).unwrap();
        assert_eq!(instance.root_token().node, 1);
    }

    #[test]
    fn test_event_order() {
        let h = harness();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut definition = three_nodes();
        let to_state = GraphElement::Transition(0);
        let start = GraphElement::Node(0);
        let state = GraphElement::Node(1);
        definition
            .add_event_action(start, EventType::BeforeSignal, recorder(&events, "before-signal"))
            .unwrap();
        definition
            .add_event_action(start, EventType::NodeLeave, recorder(&events, "leave start"))
            .unwrap();
        definition
            .add_event_action(to_state, EventType::Transition, recorder(&events, "transition"))
            .unwrap();
        definition
            .add_event_action(state, EventType::NodeEnter, recorder(&events, "enter s"))
            .unwrap();
        definition
            .add_event_action(start, EventType::AfterSignal, recorder(&events, "after-signal"))
            .unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["before-signal", "leave start", "transition", "enter s", "after-signal"]
        );

        let logged = h.log.events(instance.id());
        let leave = logged
            .iter()
            .position(|e| matches!(e, LogEvent::NodeLeave { .. }))
            .unwrap();
        let taken = logged
            .iter()
            .position(|e| matches!(e, LogEvent::TransitionTaken { .. }))
            .unwrap();
        let enter = logged
            .iter()
            .position(|e| matches!(e, LogEvent::NodeEnter { .. }))
            .unwrap();
        assert!(leave < taken && taken < enter);
    }

    #[test]
    fn test_process_level_actions_respect_propagation() {
        let h = harness();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut definition = three_nodes();
        definition
            .add_event_action(
                GraphElement::Process,
                EventType::NodeEnter,
                recorder(&events, "propagated"),
            )
            .unwrap();
        definition
            .add_event_action(
                GraphElement::Process,
                EventType::NodeEnter,
                recorder(&events, "blocked").with_propagation(false),
            )
            .unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["propagated"]);
    }

    #[test]
    fn test_exception_routed_to_nearest_handler() {
        let h = harness();
        let mut definition = three_nodes();
        let state = GraphElement::Node(1);
        definition
            .add_event_action(
                state,
                EventType::NodeEnter,
                Action::from_fn(|_| Err(ActionError::new("Timeout", "backend too slow"))).named("call"),
            )
            .unwrap();
        definition
            .add_exception_handler(
                state,
                ExceptionHandler::new("Timeout").with_action(Action::from_fn(|ctx| {
                    let kind = ctx.exception().map(|e| e.kind.clone()).unwrap_or_default();
                    ctx.set_variable("handled", kind.as_str())?;
                    Ok(())
                })),
            )
            .unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();

        assert_eq!(instance.root_token().node, 1);
        assert_eq!(
            instance.variable(ROOT_TOKEN, "handled").unwrap(),
            Some(VariableValue::from("Timeout"))
        );
        assert!(h.log.events(instance.id()).contains(&LogEvent::ExceptionHandled {
            element: "node 's'".to_string(),
            kind: "Timeout".to_string(),
        }));
    }

    #[test]
    fn test_exception_falls_back_to_process_handler() {
        let h = harness();
        let mut definition = three_nodes();
        definition
            .add_event_action(
                GraphElement::Node(1),
                EventType::NodeEnter,
                Action::from_fn(|_| Err(ActionError::new("Io", "disk full"))),
            )
            .unwrap();
        definition
            .add_exception_handler(GraphElement::Node(1), ExceptionHandler::new("Timeout"))
            .unwrap();
        definition
            .add_exception_handler(GraphElement::Process, ExceptionHandler::catch_all())
            .unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();
        assert!(h.log.events(instance.id()).contains(&LogEvent::ExceptionHandled {
            element: "process 'three-nodes'".to_string(),
            kind: "Io".to_string(),
        }));
    }

    #[test]
    fn test_unhandled_action_error_reaches_caller() {
        let h = harness();
        let mut definition = three_nodes();
        definition
            .add_event_action(
                GraphElement::Transition(0),
                EventType::Transition,
                Action::from_fn(|_| Err(ActionError::new("IllegalState", "no"))).named("guard"),
            )
            .unwrap();

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        match h.engine.signal(&mut instance) {
            Err(EngineError::Action { element, action, source }) => {
                assert_eq!(element, "transition '' (start -> s)");
                assert_eq!(action, "'guard'");
                assert_eq!(source.kind, "IllegalState");
            }
            other => panic!("expected action error, got {:?}", other),
        }
    }

    #[test]
    fn test_end_cancels_timers() {
        use crate::graph::TimerSpec;
        use crate::services::SchedulerService;

        let h = harness();
        let mut definition = three_nodes();
        definition
            .node_mut(1)
            .unwrap()
            .timers
            .push(TimerSpec::new("reminder", "2 business hours").unwrap());

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();
        assert_eq!(h.queue.jobs_for_instance(instance.id()).len(), 1);

        h.engine.end(&mut instance).unwrap();
        assert!(instance.has_ended());
        assert!(h.queue.jobs_for_instance(instance.id()).is_empty());
        assert_eq!(h.queue.delete_timers_by_process_instance(instance.id()).unwrap(), 0);
    }

    #[test]
    fn test_leaving_cancels_node_timers() {
        use crate::graph::TimerSpec;

        let h = harness();
        let mut definition = three_nodes();
        definition
            .node_mut(1)
            .unwrap()
            .timers
            .push(TimerSpec::new("reminder", "1 hour").unwrap());

        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();
        let job = &h.queue.jobs_for_instance(instance.id())[0];
        assert_eq!(job.due_date, h.engine.now() + chrono::Duration::hours(1));

        h.engine.signal(&mut instance).unwrap();
        assert!(h.queue.is_empty());
        assert!(h.log.events(instance.id()).contains(&LogEvent::TimerCancelled {
            name: "reminder".to_string()
        }));
    }
}
