//! Asynchronous Continuations
//!
//! Entering an async node locks the token and hands the node's behaviour to
//! a job. Job execution for all job kinds lives here as well.

use log::debug;

use super::context::Trigger;
use super::engine::ProcessEngine;
use super::instance::ProcessInstance;
use super::token::TokenId;
use crate::calendar::Duration;
use crate::error::EngineError;
use crate::graph::{EventType, GraphElement, NodeId};
use crate::jobs::{next_due_date, Job, JobKind, Timer};
use crate::services::DeferredOperation;

fn continuation_owner(node: &str) -> String {
    format!("async-continuation:{}", node)
}

/// The graph element a job runs on.
fn job_element(kind: &JobKind) -> GraphElement {
    match kind {
        JobKind::Timer(timer) => timer.element,
        JobKind::ExecuteNode { node } => GraphElement::Node(*node),
        JobKind::ExecuteAction { element, .. } => *element,
    }
}

impl ProcessEngine {
    pub(crate) fn send_continuation(
        &self,
        instance: &mut ProcessInstance,
        token: TokenId,
        node: NodeId,
    ) -> Result<(), EngineError> {
        let owner = continuation_owner(&instance.definition().node(node).name);
        let now = self.now();
        instance.lock_token(token, &owner, now)?;

        let job = Job::new(instance.id(), token, now, JobKind::ExecuteNode { node });
        self.dispatch(instance, DeferredOperation::Send(job))?;
        debug!(
            "Token {} continues '{}' in a job",
            instance.token_name(token),
            instance.definition().node(node).name
        );
        Ok(())
    }

    /// Runs one job against its (loaded) instance.
    ///
    /// Returns `Ok(true)` when the job is done and `Ok(false)` when it has
    /// been rescheduled to `job.due_date`. The caller saves the instance.
    /// A continuation whose token has already moved on completes without
    /// running anything.
    pub fn execute_job(&self, instance: &mut ProcessInstance, job: &mut Job) -> Result<bool, EngineError> {
        if instance.has_ended() {
            debug!("Job {} skipped: instance {} has ended", job.id, instance.id());
            return Ok(true);
        }
        instance.token(job.token)?;
        let element = job_element(&job.kind);
        if !instance.definition().contains(element) {
            return Err(EngineError::UnknownElement(element));
        }

        match job.kind.clone() {
            JobKind::Timer(timer) => self.execute_timer(instance, job, timer),
            JobKind::ExecuteNode { node } => {
                let owner = continuation_owner(&instance.definition().node(node).name);
                let waiting = instance.token(job.token)?;
                if waiting.node != node || waiting.has_ended() || waiting.lock_owner() != Some(owner.as_str()) {
                    debug!(
                        "Job {} skipped: token {} no longer waits to continue '{}'",
                        job.id,
                        instance.token_name(job.token),
                        instance.definition().node(node).name
                    );
                    return Ok(true);
                }
                instance.unlock_token(job.token, &owner)?;
                self.execute_node(instance, job.token, node)?;
                Ok(true)
            }
            JobKind::ExecuteAction { action, element, event } => {
                let trigger = Trigger {
                    token: job.token,
                    event_source: Some(element),
                    event,
                    ..Trigger::default()
                };
                self.run_action(instance, &action, element, trigger)?;
                Ok(true)
            }
        }
    }

    fn execute_timer(&self, instance: &mut ProcessInstance, job: &mut Job, timer: Timer) -> Result<bool, EngineError> {
        let token = job.token;
        self.fire_event(
            instance,
            Trigger::event(token, timer.element, EventType::Timer).with_timer(Some(timer.clone())),
        )?;
        if let Some(action) = &timer.action {
            let trigger = Trigger {
                event_source: Some(timer.element),
                ..Trigger::token(token)
            }
            .with_timer(Some(timer.clone()));
            self.run_action(instance, action, timer.element, trigger)?;
        }

        if let (Some(name), GraphElement::Node(node)) = (&timer.transition, timer.element) {
            let waiting = instance.token(token)?;
            if waiting.node == node
                && !waiting.has_ended()
                && instance.definition().leaving_transition(node, name).is_some()
            {
                debug!("Timer '{}' takes transition '{}'", timer.name, name);
                self.signal_internal(instance, token, Some(name), None)?;
                return Ok(true);
            }
        }

        if let Some(repeat) = &timer.repeat {
            let alive = !instance.has_ended() && !instance.token(token)?.has_ended();
            if alive {
                let calendar = self.calendar(timer.calendar.as_deref())?;
                job.due_date = next_due_date(job.due_date, &Duration::parse(repeat)?, calendar, self.now())?;
                debug!("Timer '{}' repeats at {}", timer.name, job.due_date);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::tests::harness;
    use crate::execution::ROOT_TOKEN;
    use crate::graph::{Action, NodeKind, ProcessDefinition, TimerSpec};
    use crate::services::{Clock, LogEvent, MessageService};
    use crate::variables::VariableValue;
    use chrono::Duration as ChronoDuration;

    fn async_definition() -> ProcessDefinition {
        let mut definition = ProcessDefinition::new("async");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        let work = definition.add_node("work", NodeKind::Node).unwrap();
        let wait = definition.add_node("wait", NodeKind::State).unwrap();
        definition.add_transition(start, work, None).unwrap();
        definition.add_transition(work, wait, None).unwrap();
        definition.node_mut(work).unwrap().is_async = true;
        definition
    }

    #[test]
    fn test_async_node_locks_token_and_sends_job() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.signal(&mut instance).unwrap();

        assert_eq!(instance.root_token().node, 1);
        assert_eq!(instance.root_token().lock_owner(), Some("async-continuation:work"));
        let jobs = h.queue.jobs_for_instance(instance.id());
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0].kind, JobKind::ExecuteNode { node: 1 }));

        assert!(matches!(
            h.engine.signal(&mut instance),
            Err(EngineError::TokenLocked { .. })
        ));
    }

    #[test]
    fn test_continuation_job_runs_node() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.signal(&mut instance).unwrap();

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 2);
        assert!(!instance.root_token().is_locked());
    }

    #[test]
    fn test_async_action_runs_from_job() {
        let h = harness();
        let mut definition = crate::execution::engine::tests::three_nodes();
        definition
            .add_event_action(
                GraphElement::Node(1),
                EventType::NodeEnter,
                Action::from_fn(|ctx| {
                    ctx.set_variable("notified", true)?;
                    Ok(())
                })
                .named("notify")
                .asynchronous(true),
            )
            .unwrap();
        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();
        assert!(!instance.has_variable(ROOT_TOKEN, "notified"));

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(
            instance.variable(ROOT_TOKEN, "notified").unwrap(),
            Some(VariableValue::Boolean(true))
        );
    }

    #[test]
    fn test_jobs_of_ended_instances_are_skipped() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.signal(&mut instance).unwrap();
        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);

        h.engine.end(&mut instance).unwrap();
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 1);
    }

    fn timed(spec: TimerSpec) -> ProcessDefinition {
        let mut definition = ProcessDefinition::new("timed");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        let wait = definition.add_node("wait", NodeKind::State).unwrap();
        let escalated = definition.add_node("escalated", NodeKind::State).unwrap();
        let done = definition.add_node("done", NodeKind::end()).unwrap();
        definition.add_transition(start, wait, None).unwrap();
        definition.add_transition(wait, escalated, Some("escalate")).unwrap();
        definition.add_transition(wait, done, Some("done")).unwrap();
        definition.node_mut(wait).unwrap().timers.push(spec);
        definition
    }

    #[test]
    fn test_timer_takes_its_transition() {
        let h = harness();
        let spec = TimerSpec::new("reminder", "2 hours").unwrap().with_transition("escalate");
        let mut instance = h.engine.start_process(h.engine.deploy(timed(spec))).unwrap();
        h.engine.signal(&mut instance).unwrap();

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        assert_eq!(job.due_date, h.clock.now() + ChronoDuration::hours(2));

        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 2);
        assert!(h.log.events(instance.id()).contains(&LogEvent::Signal {
            transition: Some("escalate".to_string())
        }));
    }

    #[test]
    fn test_timer_runs_action_and_event() {
        let h = harness();
        let spec = TimerSpec::new("ping", "5 minutes")
            .unwrap()
            .with_action(Action::from_fn(|ctx| {
                let name = ctx.timer().map(|timer| timer.name.clone()).unwrap_or_default();
                ctx.set_variable("fired", name.as_str())?;
                Ok(())
            }));
        let mut definition = timed(spec);
        definition
            .add_event_action(
                GraphElement::Node(1),
                EventType::Timer,
                Action::from_fn(|ctx| {
                    ctx.set_variable("timer-event", true)?;
                    Ok(())
                }),
            )
            .unwrap();
        let mut instance = h.engine.start_process(h.engine.deploy(definition)).unwrap();
        h.engine.signal(&mut instance).unwrap();

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 1);
        assert_eq!(
            instance.variable(ROOT_TOKEN, "fired").unwrap(),
            Some(VariableValue::from("ping"))
        );
        assert!(instance.has_variable(ROOT_TOKEN, "timer-event"));
    }

    #[test]
    fn test_repeating_timer_reschedules() {
        let h = harness();
        let spec = TimerSpec::new("poll", "10 minutes")
            .unwrap()
            .with_repeat("10 minutes")
            .unwrap();
        let mut instance = h.engine.start_process(h.engine.deploy(timed(spec))).unwrap();
        h.engine.signal(&mut instance).unwrap();

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        let first = job.due_date;
        h.clock.advance(ChronoDuration::minutes(25));

        assert!(!h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(job.due_date, first + ChronoDuration::minutes(20));
    }

    #[test]
    fn test_timer_with_missing_transition_completes() {
        let h = harness();
        let spec = TimerSpec::new("late", "1 hour").unwrap().with_transition("nowhere");
        let mut instance = h.engine.start_process(h.engine.deploy(timed(spec))).unwrap();
        h.engine.signal(&mut instance).unwrap();

        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 1);
    }

    #[test]
    fn test_manual_job_send() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        let node = 1;
        instance.lock_token(ROOT_TOKEN, &continuation_owner("work"), h.clock.now()).unwrap();
        instance.token_mut(ROOT_TOKEN).unwrap().node = node;
        let id = h
            .queue
            .send(Job::new(instance.id(), ROOT_TOKEN, h.clock.now(), JobKind::ExecuteNode { node }))
            .unwrap();

        let mut job = h.queue.get(id).unwrap();
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 2);
    }

    #[test]
    fn test_job_for_foreign_element_is_rejected() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();

        let mut job = Job::new(instance.id(), ROOT_TOKEN, h.clock.now(), JobKind::ExecuteNode { node: 42 });
        assert!(matches!(
            h.engine.execute_job(&mut instance, &mut job),
            Err(EngineError::UnknownElement(GraphElement::Node(42)))
        ));

        let mut job = Job::new(instance.id(), 7, h.clock.now(), JobKind::ExecuteNode { node: 1 });
        assert!(matches!(
            h.engine.execute_job(&mut instance, &mut job),
            Err(EngineError::UnknownToken(7))
        ));
    }

    #[test]
    fn test_continuation_of_moved_token_is_skipped() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.signal(&mut instance).unwrap();
        let mut job = h.queue.jobs_for_instance(instance.id()).remove(0);

        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 2);

        // Running the same continuation again must not move the token twice.
        assert!(h.engine.execute_job(&mut instance, &mut job).unwrap());
        assert_eq!(instance.root_token().node, 2);
        assert!(!instance.root_token().is_locked());
    }

    #[test]
    fn test_deferred_jobs_wait_for_save() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.save(&mut instance).unwrap();

        let mut unsaved = h.engine.load(instance.id()).unwrap();
        unsaved.defer_jobs();
        h.engine.signal(&mut unsaved).unwrap();
        assert_eq!(unsaved.deferred().len(), 1);
        assert!(h.queue.is_empty());
        drop(unsaved);
        assert!(h.queue.is_empty());

        let mut saved = h.engine.load(instance.id()).unwrap();
        saved.defer_jobs();
        h.engine.signal(&mut saved).unwrap();
        h.engine.save(&mut saved).unwrap();
        assert!(saved.deferred().is_empty());
        assert!(saved.defers_jobs());
        assert_eq!(h.queue.jobs_for_instance(instance.id()).len(), 1);

        let reloaded = h.engine.load(instance.id()).unwrap();
        assert!(!reloaded.defers_jobs());
    }

    #[test]
    fn test_stale_save_keeps_deferred_jobs_back() {
        let h = harness();
        let mut instance = h.engine.start_process(h.engine.deploy(async_definition())).unwrap();
        h.engine.save(&mut instance).unwrap();

        let mut racing = h.engine.load(instance.id()).unwrap();
        racing.defer_jobs();
        h.engine.signal(&mut racing).unwrap();

        let mut winner = h.engine.load(instance.id()).unwrap();
        h.engine.save(&mut winner).unwrap();

        assert!(h.engine.save(&mut racing).unwrap_err().is_stale_version());
        assert_eq!(racing.deferred().len(), 1);
        assert!(h.queue.is_empty());
    }
}
