//! Process Engine
//!
//! The entry point for driving process instances:
//! - Deploying definitions and starting instances
//! - Signalling tokens, locking and direct placement
//! - Suspend, resume and end
//! - Variable access with process logging
//! - Saving instances together with their sub-process cascade
//!
//! Traversal itself lives in [`super::traversal`] and [`super::nodes`];
//! job execution in [`super::continuation`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{debug, error, info};

use super::context::Trigger;
use super::instance::{InstanceId, ProcessInstance, SuperProcessToken};
use super::token::{TokenId, ROOT_TOKEN};
use crate::calendar::{BusinessCalendar, Duration};
use crate::config::{EngineConfig, DEFAULT_CALENDAR};
use crate::error::EngineError;
use crate::graph::{DefinitionError, EventType, GraphElement, NodeId, ProcessDefinition, TimerSpec};
use crate::jobs::{Job, JobKind, Timer};
use crate::services::{DeferredOperation, LogEvent, Permission, PersistenceError, ProcessLog, Services};
use crate::variables::{SetOutcome, TypeRegistry, VariableValue};

/// Drives process instances against a fixed configuration and set of
/// collaborators.
///
/// # Example
///
/// ```rust
/// use flowrunner::config::EngineConfig;
/// use flowrunner::execution::ProcessEngine;
/// use flowrunner::graph::{NodeKind, ProcessDefinition};
/// use flowrunner::services::Services;
///
/// let mut definition = ProcessDefinition::new("approval");
/// let start = definition.add_node("start", NodeKind::Start).unwrap();
/// let review = definition.add_node("review", NodeKind::State).unwrap();
/// definition.add_transition(start, review, None).unwrap();
///
/// let (services, _queue) = Services::in_memory(3);
/// let engine = ProcessEngine::new(EngineConfig::default(), services).unwrap();
/// let definition = engine.deploy(definition);
///
/// let mut instance = engine.start_process(definition).unwrap();
/// engine.signal(&mut instance).unwrap();
/// assert_eq!(instance.root_token().node, review);
/// ```
pub struct ProcessEngine {
    config: EngineConfig,
    types: TypeRegistry,
    calendars: BTreeMap<String, BusinessCalendar>,
    services: Services,
}

impl ProcessEngine {
    /// Builds the type registry and calendars once, up front.
    pub fn new(config: EngineConfig, services: Services) -> Result<Self, EngineError> {
        let types = config.type_registry()?;
        let calendars = config.business_calendars()?;
        info!(
            "Process engine ready ({} variable types, calendars: {})",
            types.len(),
            calendars.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            config,
            types,
            calendars,
            services,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Named business calendar; `None` selects the default one.
    pub fn calendar(&self, name: Option<&str>) -> Result<&BusinessCalendar, EngineError> {
        let name = name.unwrap_or(DEFAULT_CALENDAR);
        self.calendars
            .get(name)
            .ok_or_else(|| EngineError::UnknownCalendar(name.to_string()))
    }

    pub fn now(&self) -> NaiveDateTime {
        self.services.clock().now()
    }

    /// Publishes a definition as the next version of its name.
    pub fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        self.services.persistence().deploy(definition)
    }

    /// Creates an instance whose root token waits in the start node.
    pub fn start_process(&self, definition: Arc<ProcessDefinition>) -> Result<ProcessInstance, EngineError> {
        self.create_instance(definition, None, false)
    }

    /// Starts the latest deployed version of `name`.
    pub fn start_process_by_name(&self, name: &str) -> Result<ProcessInstance, EngineError> {
        let definition = self
            .services
            .persistence()
            .find_definition(name)
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))?;
        self.start_process(definition)
    }

    pub(crate) fn create_instance(
        &self,
        definition: Arc<ProcessDefinition>,
        super_token: Option<SuperProcessToken>,
        defer_jobs: bool,
    ) -> Result<ProcessInstance, EngineError> {
        let start = definition
            .start_node()
            .map(|node| node.id)
            .ok_or_else(|| {
                DefinitionError::Invalid(format!("process '{}' has no start node", definition.name()))
            })?;

        let id = self.services.persistence().assign_id();
        let mut instance = ProcessInstance::new(id, definition, start, self.now());
        if let Some(super_token) = super_token {
            instance.set_super_process_token(super_token);
        }
        if defer_jobs {
            instance.defer_jobs();
        }

        info!(
            "Started process instance {} of '{}' v{}",
            id,
            instance.definition().name(),
            instance.definition().version()
        );
        self.log(&mut instance, ROOT_TOKEN, LogEvent::ProcessStart);
        self.fire_event(
            &mut instance,
            Trigger::event(ROOT_TOKEN, GraphElement::Process, EventType::ProcessStart),
        )?;
        Ok(instance)
    }

    /// Signals the root token over its default transition.
    pub fn signal(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        self.signal_as(instance, ROOT_TOKEN, None, None)
    }

    pub fn signal_token(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<(), EngineError> {
        self.signal_as(instance, token, None, None)
    }

    pub fn signal_transition(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: &str,
    ) -> Result<(), EngineError> {
        self.signal_as(instance, token, Some(transition), None)
    }

    /// Signals `token` on behalf of `owner`.
    ///
    /// A locked token only accepts signals from its lock owner.
    pub fn signal_as(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        transition: Option<&str>,
        owner: Option<&str>,
    ) -> Result<(), EngineError> {
        self.authorize("signal", instance)?;
        self.signal_internal(instance, token, transition, owner)
    }

    pub fn lock(&self, instance: &mut ProcessInstance, token: TokenId, owner: &str) -> Result<(), EngineError> {
        instance.lock_token(token, owner, self.now())
    }

    pub fn unlock(&self, instance: &mut ProcessInstance, token: TokenId, owner: &str) -> Result<(), EngineError> {
        instance.unlock_token(token, owner)
    }

    /// Clears a lock without checking its owner.
    pub fn force_unlock(&self, instance: &mut ProcessInstance, token: TokenId) -> Result<(), EngineError> {
        instance.force_unlock(token)
    }

    /// Moves a token to a node without firing events or running behaviour.
    pub fn set_node(&self, instance: &mut ProcessInstance, token: TokenId, node: &str) -> Result<(), EngineError> {
        let id = instance
            .definition()
            .node_by_name(node)
            .map(|node| node.id)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;
        let now = self.now();
        let token = instance.token_mut(token)?;
        token.node = id;
        token.node_enter = now;
        Ok(())
    }

    /// Suspends every token and every job of the instance.
    pub fn suspend(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        self.authorize("suspend", instance)?;
        instance.set_suspended(true);
        self.dispatch(instance, DeferredOperation::SuspendJobs(instance.id()))?;
        info!("Suspended process instance {}", instance.id());
        Ok(())
    }

    pub fn resume(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        self.authorize("resume", instance)?;
        instance.set_suspended(false);
        self.dispatch(instance, DeferredOperation::ResumeJobs(instance.id()))?;
        info!("Resumed process instance {}", instance.id());
        Ok(())
    }

    /// Ends the instance wherever its tokens are.
    pub fn end(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        self.authorize("end", instance)?;
        self.end_instance(instance)
    }

    pub fn variable(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
        name: &str,
    ) -> Result<Option<VariableValue>, EngineError> {
        Ok(instance.variable(token, name)?)
    }

    pub fn variables(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
    ) -> Result<BTreeMap<String, VariableValue>, EngineError> {
        Ok(instance.variables(token)?)
    }

    /// Writes a variable through the scope rules and logs where it landed.
    pub fn set_variable(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        name: &str,
        value: VariableValue,
    ) -> Result<(), EngineError> {
        let (owner, outcome) = instance.set_variable(token, name, value, &self.types)?;
        let name = name.to_string();
        let event = match outcome {
            SetOutcome::Created => LogEvent::VariableCreate { name },
            SetOutcome::Updated | SetOutcome::Replaced => LogEvent::VariableUpdate { name },
        };
        self.log(instance, owner, event);
        Ok(())
    }

    /// Returns whether a definition was removed.
    pub fn delete_variable(&self, instance: &mut ProcessInstance, token: TokenId, name: &str) -> Result<bool, EngineError> {
        match instance.delete_variable(token, name) {
            Some(owner) => {
                self.log(
                    instance,
                    owner,
                    LogEvent::VariableDelete {
                        name: name.to_string(),
                    },
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persists the instance and the sub-process instances it created.
    ///
    /// This is the checkpoint where unpersistable variables fail. An ended
    /// sub-process that has not yet notified its super-process token
    /// completes that token here. Deferred job operations are applied only
    /// once the instance is stored.
    pub fn save(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        instance
            .check_persistable()
            .map_err(|err| PersistenceError::Unpersistable {
                instance: instance.id(),
                reason: err.to_string(),
            })?;

        if instance.has_ended() && !instance.super_notified() {
            if let Some(super_token) = instance.super_process_token() {
                instance.set_super_notified();
                let mut parent = self.services.persistence().load(super_token.instance)?;
                if instance.defers_jobs() {
                    parent.defer_jobs();
                }
                self.complete_sub_process(&mut parent, super_token.token, instance)?;
                self.save(&mut parent)?;
            }
        }

        let deferred = instance.take_deferred();
        if let Err(err) = self.services.persistence().save(instance) {
            instance.restore_deferred(deferred);
            return Err(err.into());
        }
        if let Some(operations) = deferred {
            instance.defer_jobs();
            self.apply_deferred(instance.id(), operations);
        }

        for mut child in instance.take_cascade() {
            self.save(&mut child)?;
        }
        Ok(())
    }

    pub fn load(&self, id: InstanceId) -> Result<ProcessInstance, EngineError> {
        Ok(self.services.persistence().load(id)?)
    }

    /// The instance is already stored, so a rejected operation is logged
    /// rather than failing the save.
    fn apply_deferred(&self, instance: InstanceId, operations: Vec<DeferredOperation>) {
        debug!("Applying {} deferred job operations of instance {}", operations.len(), instance);
        for operation in operations {
            if let Err(err) = self.services.apply(operation) {
                error!("Deferred job operation of instance {} failed: {}", instance, err);
            }
        }
    }

    /// Runs a messaging or scheduler call, or queues it on an instance that
    /// defers jobs. Returns how many jobs it touched when it ran.
    pub(crate) fn dispatch(
        &self,
        instance: &mut ProcessInstance,
        operation: DeferredOperation,
    ) -> Result<Option<usize>, EngineError> {
        match instance.deferred_mut() {
            Some(deferred) => {
                deferred.push(operation);
                Ok(None)
            }
            None => Ok(Some(self.services.apply(operation)?)),
        }
    }

    pub(crate) fn authorize(&self, operation: &'static str, instance: &ProcessInstance) -> Result<(), EngineError> {
        if let Some(authorization) = self.services.authorization() {
            let permission = Permission {
                operation,
                instance: instance.id(),
            };
            if !authorization.check_permission(&permission) {
                return Err(EngineError::PermissionDenied(permission.to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn log(&self, instance: &mut ProcessInstance, token: TokenId, event: LogEvent) {
        let index = match instance.token_mut(token) {
            Ok(token) => token.next_log_index(),
            Err(_) => 0,
        };
        self.services.logging().log(ProcessLog {
            instance: instance.id(),
            token,
            index,
            time: self.now(),
            event,
        });
    }

    /// Schedules a timer for `token`.
    pub(crate) fn create_timer(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        element: GraphElement,
        spec: &TimerSpec,
    ) -> Result<(), EngineError> {
        let calendar = self.calendar(spec.calendar.as_deref())?;
        let due = calendar.add(self.now(), &Duration::parse(&spec.due)?)?;

        let timer = Timer {
            name: spec.name.clone(),
            repeat: spec.repeat.clone(),
            transition: spec.transition.clone(),
            action: spec.action.clone(),
            element,
            calendar: spec.calendar.clone(),
        };
        let job = Job::new(instance.id(), token, due, JobKind::Timer(timer));
        self.dispatch(instance, DeferredOperation::CreateTimer(job))?;

        debug!("Timer '{}' on token {} due {}", spec.name, instance.token_name(token), due);
        self.log(
            instance,
            token,
            LogEvent::TimerCreated {
                name: spec.name.clone(),
            },
        );
        Ok(())
    }

    /// Cancels the timers called `name` on `token`.
    ///
    /// Returns how many were cancelled, or `None` while the instance
    /// defers jobs.
    pub(crate) fn cancel_timer(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        name: &str,
    ) -> Result<Option<usize>, EngineError> {
        let operation = DeferredOperation::DeleteTimersByName {
            name: name.to_string(),
            instance: instance.id(),
            token,
        };
        let cancelled = self.dispatch(instance, operation)?;
        if cancelled.map_or(true, |count| count > 0) {
            self.log(
                instance,
                token,
                LogEvent::TimerCancelled {
                    name: name.to_string(),
                },
            );
        }
        Ok(cancelled)
    }

    pub(crate) fn create_node_timers(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        for spec in &definition.node(node).timers {
            self.create_timer(instance, token, GraphElement::Node(node), spec)?;
        }
        Ok(())
    }

    pub(crate) fn cancel_node_timers(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
    ) -> Result<(), EngineError> {
        let definition = instance.definition_arc();
        for spec in &definition.node(node).timers {
            self.cancel_timer(instance, token, &spec.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::{Action, NodeKind};
    use crate::jobs::JobQueue;
    use crate::services::{AuthorizationService, FixedClock, MemoryLog};
    use crate::variables::OpaqueValue;
    use chrono::NaiveDate;

    pub(crate) struct Harness {
        pub engine: Arc<ProcessEngine>,
        pub queue: Arc<JobQueue>,
        pub log: Arc<MemoryLog>,
        pub clock: Arc<FixedClock>,
    }

    /// Thursday 2005-04-07 09:00, inside default business hours.
    pub(crate) fn thursday_morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2005, 4, 7)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    pub(crate) fn harness() -> Harness {
        let (services, queue) = Services::in_memory(3);
        let log = Arc::new(MemoryLog::new());
        let clock = Arc::new(FixedClock::new(thursday_morning()));
        let services = services.with_logging(log.clone()).with_clock(clock.clone());
        let engine = ProcessEngine::new(EngineConfig::default(), services).unwrap();

        Harness {
            engine: Arc::new(engine),
            queue,
            log,
            clock,
        }
    }

    /// start -> s -> end
    pub(crate) fn three_nodes() -> ProcessDefinition {
        let mut definition = ProcessDefinition::new("three-nodes");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        let state = definition.add_node("s", NodeKind::State).unwrap();
        let end = definition.add_node("end", NodeKind::end()).unwrap();
        definition.add_transition(start, state, None).unwrap();
        definition.add_transition(state, end, None).unwrap();
        definition
    }

    #[test]
    fn test_three_node_process_runs_to_end() {
        let h = harness();
        let definition = h.engine.deploy(three_nodes());
        let mut instance = h.engine.start_process(definition).unwrap();
        assert_eq!(instance.root_token().node, 0);

        h.engine.signal(&mut instance).unwrap();
        assert_eq!(instance.root_token().node, 1);
        assert!(!instance.has_ended());

        h.engine.signal(&mut instance).unwrap();
        assert_eq!(instance.root_token().node, 2);
        assert!(instance.has_ended());
        assert!(instance.root_token().has_ended());

        assert!(matches!(
            h.engine.signal(&mut instance),
            Err(EngineError::InstanceEnded(_))
        ));
    }

    #[test]
    fn test_start_by_name_uses_latest_version() {
        let h = harness();
        h.engine.deploy(three_nodes());
        h.engine.deploy(three_nodes());

        let instance = h.engine.start_process_by_name("three-nodes").unwrap();
        assert_eq!(instance.definition().version(), 2);
        assert!(matches!(
            h.engine.start_process_by_name("missing"),
            Err(EngineError::UnknownDefinition(_))
        ));
    }

    #[test]
    fn test_process_start_event_runs() {
        let h = harness();
        let mut definition = three_nodes();
        definition
            .add_event_action(
                GraphElement::Process,
                EventType::ProcessStart,
                Action::from_fn(|ctx| {
                    ctx.set_variable("started", true)?;
                    Ok(())
                }),
            )
            .unwrap();

        let instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        assert_eq!(
            instance.variable(ROOT_TOKEN, "started").unwrap(),
            Some(VariableValue::Boolean(true))
        );
    }

    #[test]
    fn test_variable_writes_are_logged() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();

        h.engine.set_variable(&mut instance, ROOT_TOKEN, "n", 1.into()).unwrap();
        h.engine.set_variable(&mut instance, ROOT_TOKEN, "n", 2.into()).unwrap();
        assert!(h.engine.delete_variable(&mut instance, ROOT_TOKEN, "n").unwrap());
        assert!(!h.engine.delete_variable(&mut instance, ROOT_TOKEN, "n").unwrap());

        let events = h.log.events(instance.id());
        let name = "n".to_string();
        assert!(events.contains(&LogEvent::VariableCreate { name: name.clone() }));
        assert!(events.contains(&LogEvent::VariableUpdate { name: name.clone() }));
        assert!(events.contains(&LogEvent::VariableDelete { name }));
    }

    #[test]
    fn test_unpersistable_variable_fails_at_save() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();

        h.engine
            .set_variable(&mut instance, ROOT_TOKEN, "socket", OpaqueValue::new(42u16).into())
            .unwrap();

        let err = h.engine.save(&mut instance).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Persistence(PersistenceError::Unpersistable { .. })
        ));

        h.engine.delete_variable(&mut instance, ROOT_TOKEN, "socket").unwrap();
        h.engine.save(&mut instance).unwrap();
        assert_eq!(instance.version(), 1);
    }

    #[test]
    fn test_save_and_load_round_trip_state() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();
        h.engine.signal(&mut instance).unwrap();
        h.engine.save(&mut instance).unwrap();

        let loaded = h.engine.load(instance.id()).unwrap();
        assert_eq!(loaded.root_token().node, 1);
        assert_eq!(loaded.version(), 1);
    }

    #[test]
    fn test_set_node_places_token() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(three_nodes())).unwrap();

        h.engine.set_node(&mut instance, ROOT_TOKEN, "s").unwrap();
        assert_eq!(instance.root_token().node, 1);
        assert!(matches!(
            h.engine.set_node(&mut instance, ROOT_TOKEN, "nowhere"),
            Err(EngineError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_unknown_calendar() {
        let h = harness();
        assert!(h.engine.calendar(None).is_ok());
        assert!(matches!(
            h.engine.calendar(Some("lunar")),
            Err(EngineError::UnknownCalendar(_))
        ));
    }

    struct DenySuspend;

    impl AuthorizationService for DenySuspend {
        fn check_permission(&self, permission: &Permission) -> bool {
            permission.operation != "suspend"
        }
    }

    #[test]
    fn test_authorization_guards_operations() {
        let (services, _queue) = Services::in_memory(3);
        let services = services.with_authorization(Arc::new(DenySuspend));
        let engine = ProcessEngine::new(EngineConfig::default(), services).unwrap();
        let mut instance = engine.start_process(engine.deploy(three_nodes())).unwrap();

        engine.signal(&mut instance).unwrap();
        assert!(matches!(
            engine.suspend(&mut instance),
            Err(EngineError::PermissionDenied(_))
        ));
        assert!(!instance.is_suspended());
    }
}
