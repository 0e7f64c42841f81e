//! Actions, decision handlers and exception handlers.
//!
//! User behaviour is plugged into a definition through [`ActionHandler`]
//! trait objects. Definitions loaded from YAML refer to handlers by name;
//! the [`ActionRegistry`] resolves those names once, at load time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::info;

use crate::error::ActionError;
use crate::execution::ExecutionContext;

/// Code run when an event fires or a custom node executes.
pub trait ActionHandler: Send + Sync {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), ActionError>;
}

struct FnAction<F>(F);

impl<F> ActionHandler for FnAction<F>
where
    F: Fn(&mut ExecutionContext<'_>) -> Result<(), ActionError> + Send + Sync,
{
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), ActionError> {
        (self.0)(ctx)
    }
}

/// An action attached to a graph element.
#[derive(Clone)]
pub struct Action {
    name: Option<String>,
    handler: Arc<dyn ActionHandler>,
    is_async: bool,
    propagation_allowed: bool,
}

impl Action {
    pub fn new(handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: None,
            handler,
            is_async: false,
            propagation_allowed: true,
        }
    }

    /// Wraps a closure as an action.
    ///
    /// ```rust
    /// use flowrunner::graph::Action;
    ///
    /// let action = Action::from_fn(|ctx| {
    ///     ctx.set_variable("approved", true)?;
    ///     Ok(())
    /// })
    /// .named("approve");
    /// assert_eq!(action.name(), Some("approve"));
    /// ```
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnAction(f)))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Run from a job instead of inline.
    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    /// Whether events propagated from enclosed elements trigger this action.
    pub fn with_propagation(mut self, allowed: bool) -> Self {
        self.propagation_allowed = allowed;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("'{}'", name),
            None => "<anonymous>".to_string(),
        }
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn propagation_allowed(&self) -> bool {
        self.propagation_allowed
    }

    pub fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), ActionError> {
        self.handler.execute(ctx)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("is_async", &self.is_async)
            .field("propagation_allowed", &self.propagation_allowed)
            .finish()
    }
}

/// Picks the leaving transition of a decision node by name.
pub trait DecisionHandler: Send + Sync {
    fn decide(&self, ctx: &ExecutionContext<'_>) -> Result<String, ActionError>;
}

struct FnDecision<F>(F);

impl<F> DecisionHandler for FnDecision<F>
where
    F: Fn(&ExecutionContext<'_>) -> Result<String, ActionError> + Send + Sync,
{
    fn decide(&self, ctx: &ExecutionContext<'_>) -> Result<String, ActionError> {
        (self.0)(ctx)
    }
}

/// Wraps a closure as a decision handler.
pub fn decision_fn<F>(f: F) -> Arc<dyn DecisionHandler>
where
    F: Fn(&ExecutionContext<'_>) -> Result<String, ActionError> + Send + Sync + 'static,
{
    Arc::new(FnDecision(f))
}

/// Actions run when an action on the owning element fails with a matching
/// error kind.
#[derive(Debug, Clone, Default)]
pub struct ExceptionHandler {
    kind: Option<String>,
    actions: Vec<Action>,
}

impl ExceptionHandler {
    /// Handles failures whose kind equals `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            actions: Vec::new(),
        }
    }

    /// Handles every failure.
    pub fn catch_all() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn matches(&self, kind: &str) -> bool {
        self.kind.as_deref().map_or(true, |expected| expected == kind)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// Logs the node and token an event fired on.
struct LogAction;

impl ActionHandler for LogAction {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), ActionError> {
        let event = ctx.event().map(|e| e.to_string()).unwrap_or_default();
        let node = ctx.node_name().unwrap_or_default();
        info!(
            "[{}] instance {} token {} at '{}'",
            event,
            ctx.instance().id(),
            ctx.token_name(),
            node
        );
        Ok(())
    }
}

struct NoopAction;

impl ActionHandler for NoopAction {
    fn execute(&self, _ctx: &mut ExecutionContext<'_>) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Name to handler lookup used when loading definitions.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log` and `noop`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogAction));
        registry.register("noop", Arc::new(NoopAction));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ExecutionContext<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnAction(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
