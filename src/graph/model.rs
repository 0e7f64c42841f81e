//! Process Definition Model
//!
//! The immutable graph a process instance runs on: nodes, transitions,
//! event actions, exception handlers and node timers. Nodes and transitions
//! live in vectors owned by the definition and refer to each other by index.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::action::{Action, DecisionHandler, ExceptionHandler};
use super::expression::Expression;
use super::DefinitionError;
use crate::calendar::{CalendarError, Duration};
use crate::error::EngineError;

/// Index of a node within its definition.
pub type NodeId = usize;

/// Index of a transition within its definition.
pub type TransitionId = usize;

/// Anything events and exception handlers can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphElement {
    Process,
    Node(NodeId),
    Transition(TransitionId),
}

/// Points in the traversal where actions run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    NodeEnter,
    NodeLeave,
    Transition,
    BeforeSignal,
    AfterSignal,
    ProcessStart,
    ProcessEnd,
    Timer,
    SubprocessCreated,
    SubprocessEnd,
    Custom(String),
}

impl EventType {
    pub fn name(&self) -> &str {
        match self {
            Self::NodeEnter => "node-enter",
            Self::NodeLeave => "node-leave",
            Self::Transition => "transition",
            Self::BeforeSignal => "before-signal",
            Self::AfterSignal => "after-signal",
            Self::ProcessStart => "process-start",
            Self::ProcessEnd => "process-end",
            Self::Timer => "timer",
            Self::SubprocessCreated => "subprocess-created",
            Self::SubprocessEnd => "subprocess-end",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "node-enter" => Self::NodeEnter,
            "node-leave" => Self::NodeLeave,
            "transition" => Self::Transition,
            "before-signal" => Self::BeforeSignal,
            "after-signal" => Self::AfterSignal,
            "process-start" => Self::ProcessStart,
            "process-end" => Self::ProcessEnd,
            "timer" => Self::Timer,
            "subprocess-created" => Self::SubprocessCreated,
            "subprocess-end" => Self::SubprocessEnd,
            other => Self::Custom(other.to_string()),
        };
        Ok(event)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-lock policy a join takes on the parent token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JoinLockMode {
    None,
    Read,
    #[default]
    Upgrade,
    Pessimistic,
}

impl FromStr for JoinLockMode {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "READ" => Ok(Self::Read),
            "UPGRADE" => Ok(Self::Upgrade),
            "PESSIMISTIC" => Ok(Self::Pessimistic),
            _ => Err(DefinitionError::InvalidLockMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for JoinLockMode {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JoinLockMode> for String {
    fn from(mode: JoinLockMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for JoinLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Read => "READ",
            Self::Upgrade => "UPGRADE",
            Self::Pessimistic => "PESSIMISTIC",
        };
        f.write_str(name)
    }
}

/// When a join lets the parent token continue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinConfig {
    /// Overrides the engine-wide lock mode
    pub lock_mode: Option<JoinLockMode>,
    /// Continue on the first arrival
    pub discriminator: bool,
    /// Continue once these named children have arrived
    pub token_names: Option<Vec<String>>,
    /// Continue once this many children have arrived
    pub n_out_of_m: Option<usize>,
}

#[derive(Clone, Default)]
pub struct DecisionConfig {
    pub handler: Option<Arc<dyn DecisionHandler>>,
    /// Evaluates to the name of the transition to take
    pub expression: Option<Expression>,
    pub default_transition: Option<String>,
}

impl fmt::Debug for DecisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionConfig")
            .field("handler", &self.handler.is_some())
            .field("expression", &self.expression)
            .field("default_transition", &self.default_transition)
            .finish()
    }
}

/// Copies a variable between a super-process token and a sub-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableMapping {
    /// Name in the super-process
    pub name: String,
    /// Name in the sub-process
    pub mapped_name: String,
    /// Copied into the sub-process when it starts
    pub read: bool,
    /// Copied back when the sub-process ends
    pub write: bool,
}

impl VariableMapping {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            mapped_name: name.clone(),
            name,
            read: true,
            write: true,
        }
    }

    pub fn with_mapped_name(mut self, mapped_name: impl Into<String>) -> Self {
        self.mapped_name = mapped_name.into();
        self
    }

    pub fn with_access(mut self, read: bool, write: bool) -> Self {
        self.read = read;
        self.write = write;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubProcessConfig {
    /// Name of the definition to start; the latest deployed version is used
    pub definition: String,
    pub variables: Vec<VariableMapping>,
}

impl SubProcessConfig {
    pub fn new(definition: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            variables: Vec::new(),
        }
    }

    pub fn with_mapping(mut self, mapping: VariableMapping) -> Self {
        self.variables.push(mapping);
        self
    }
}

/// Node behaviours.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    State,
    TaskNode,
    /// Runs its action, which decides how to continue
    Node,
    Fork,
    Join(JoinConfig),
    Decision(DecisionConfig),
    ProcessState(SubProcessConfig),
    End { end_complete_process: bool },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::State => "state",
            Self::TaskNode => "task-node",
            Self::Node => "node",
            Self::Fork => "fork",
            Self::Join(_) => "join",
            Self::Decision(_) => "decision",
            Self::ProcessState(_) => "process-state",
            Self::End { .. } => "end",
        }
    }

    pub fn end() -> Self {
        Self::End {
            end_complete_process: false,
        }
    }

    pub fn join() -> Self {
        Self::Join(JoinConfig::default())
    }
}

/// A timer a node creates on entry and cancels on leave.
#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub name: String,
    /// Duration expression from node entry to the first firing
    pub due: String,
    pub repeat: Option<String>,
    /// Transition taken when the timer fires
    pub transition: Option<String>,
    pub action: Option<Action>,
    /// Named business calendar; the default one when absent
    pub calendar: Option<String>,
}

impl TimerSpec {
    pub fn new(name: impl Into<String>, due: impl Into<String>) -> Result<Self, CalendarError> {
        let due = due.into();
        Duration::parse(&due)?;
        Ok(Self {
            name: name.into(),
            due,
            repeat: None,
            transition: None,
            action: None,
            calendar: None,
        })
    }

    pub fn with_repeat(mut self, repeat: impl Into<String>) -> Result<Self, CalendarError> {
        let repeat = repeat.into();
        Duration::parse(&repeat)?;
        self.repeat = Some(repeat);
        Ok(self)
    }

    pub fn with_transition(mut self, transition: impl Into<String>) -> Self {
        self.transition = Some(transition.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_calendar(mut self, calendar: impl Into<String>) -> Self {
        self.calendar = Some(calendar.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    leaving: Vec<TransitionId>,
    arriving: Vec<TransitionId>,
    pub events: BTreeMap<EventType, Vec<Action>>,
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Behaviour of [`NodeKind::Node`]
    pub action: Option<Action>,
    pub timers: Vec<TimerSpec>,
    /// Execute the node from a job instead of inline
    pub is_async: bool,
}

impl Node {
    pub fn leaving(&self) -> &[TransitionId] {
        &self.leaving
    }

    pub fn arriving(&self) -> &[TransitionId] {
        &self.arriving
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub name: Option<String>,
    pub from: NodeId,
    pub to: NodeId,
    /// Guard evaluated by decisions
    pub condition: Option<Expression>,
    pub actions: Vec<Action>,
    pub exception_handlers: Vec<ExceptionHandler>,
}

/// A process graph.
///
/// Built once, then shared immutably behind an `Arc` by every instance.
///
/// # Example
///
/// ```rust
/// use flowrunner::graph::{NodeKind, ProcessDefinition};
///
/// let mut definition = ProcessDefinition::new("approval");
/// let start = definition.add_node("start", NodeKind::Start).unwrap();
/// let review = definition.add_node("review", NodeKind::State).unwrap();
/// definition.add_transition(start, review, None).unwrap();
/// assert_eq!(definition.start_node().map(|n| n.id), Some(start));
/// ```
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    name: String,
    version: u32,
    nodes: Vec<Node>,
    transitions: Vec<Transition>,
    events: BTreeMap<EventType, Vec<Action>>,
    exception_handlers: Vec<ExceptionHandler>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            nodes: Vec::new(),
            transitions: Vec::new(),
            events: BTreeMap::new(),
            exception_handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deployment version; 0 until deployed.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> Result<NodeId, DefinitionError> {
        let name = name.into();
        if self.node_by_name(&name).is_some() {
            return Err(DefinitionError::DuplicateNode(name));
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name,
            kind,
            leaving: Vec::new(),
            arriving: Vec::new(),
            events: BTreeMap::new(),
            exception_handlers: Vec::new(),
            action: None,
            timers: Vec::new(),
            is_async: false,
        });
        Ok(id)
    }

    /// Connects two nodes of this definition.
    pub fn add_transition(
        &mut self,
        from: NodeId,
        to: NodeId,
        name: Option<&str>,
    ) -> Result<TransitionId, DefinitionError> {
        if from >= self.nodes.len() {
            return Err(DefinitionError::UnknownElement(GraphElement::Node(from)));
        }
        if to >= self.nodes.len() {
            return Err(DefinitionError::UnknownElement(GraphElement::Node(to)));
        }
        if let Some(name) = name {
            if self.leaving_transition(from, name).is_some() {
                return Err(DefinitionError::DuplicateTransition {
                    node: self.nodes[from].name.clone(),
                    transition: name.to_string(),
                });
            }
        }

        let id = self.transitions.len();
        self.transitions.push(Transition {
            id,
            name: name.map(str::to_string),
            from,
            to,
            condition: None,
            actions: Vec::new(),
            exception_handlers: Vec::new(),
        });
        self.nodes[from].leaving.push(id);
        self.nodes[to].arriving.push(id);
        Ok(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, DefinitionError> {
        self.nodes
            .get_mut(id)
            .ok_or(DefinitionError::UnknownElement(GraphElement::Node(id)))
    }

    pub fn transition_mut(&mut self, id: TransitionId) -> Result<&mut Transition, DefinitionError> {
        self.transitions
            .get_mut(id)
            .ok_or(DefinitionError::UnknownElement(GraphElement::Transition(id)))
    }

    /// Registers an action for `event` on `element`.
    ///
    /// Transition actions are registered under [`EventType::Transition`].
    pub fn add_event_action(
        &mut self,
        element: GraphElement,
        event: EventType,
        action: Action,
    ) -> Result<(), DefinitionError> {
        match element {
            GraphElement::Process => self.events.entry(event).or_default().push(action),
            GraphElement::Node(id) => self.node_mut(id)?.events.entry(event).or_default().push(action),
            GraphElement::Transition(id) => {
                let transition = self.transition_mut(id)?;
                if event == EventType::Transition {
                    transition.actions.push(action);
                } else {
                    return Err(DefinitionError::UnknownEvent {
                        element: format!("transition {}", id),
                        event: event.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn add_exception_handler(
        &mut self,
        element: GraphElement,
        handler: ExceptionHandler,
    ) -> Result<(), DefinitionError> {
        match element {
            GraphElement::Process => self.exception_handlers.push(handler),
            GraphElement::Node(id) => self.node_mut(id)?.exception_handlers.push(handler),
            GraphElement::Transition(id) => self.transition_mut(id)?.exception_handlers.push(handler),
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Node by id.
    ///
    /// Ids are only handed out by this definition; a foreign id panics.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Transition by id; a foreign id panics.
    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id]
    }

    /// Whether `element` is one of this definition's elements.
    pub fn contains(&self, element: GraphElement) -> bool {
        match element {
            GraphElement::Process => true,
            GraphElement::Node(id) => id < self.nodes.len(),
            GraphElement::Transition(id) => id < self.transitions.len(),
        }
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| matches!(node.kind, NodeKind::Start))
    }

    pub fn leaving_transition(&self, node: NodeId, name: &str) -> Option<TransitionId> {
        self.nodes.get(node)?.leaving.iter().copied().find(|id| {
            self.transitions[*id].name.as_deref() == Some(name)
        })
    }

    /// The single leaving transition of `node`.
    pub fn default_leaving_transition(&self, node: NodeId) -> Result<TransitionId, EngineError> {
        let node = self.node(node);
        match node.leaving.as_slice() {
            [only] => Ok(*only),
            [] => Err(EngineError::NoLeavingTransition {
                node: node.name.clone(),
            }),
            many => Err(EngineError::AmbiguousTransition {
                node: node.name.clone(),
                count: many.len(),
            }),
        }
    }

    /// Actions registered for `event` on `element`.
    pub fn event_actions(&self, element: GraphElement, event: &EventType) -> &[Action] {
        let events = match element {
            GraphElement::Process => &self.events,
            GraphElement::Node(id) => &self.node(id).events,
            GraphElement::Transition(id) => {
                return match event {
                    EventType::Transition => self.transition(id).actions.as_slice(),
                    _ => &[],
                };
            }
        };
        events.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn exception_handlers(&self, element: GraphElement) -> &[ExceptionHandler] {
        match element {
            GraphElement::Process => &self.exception_handlers,
            GraphElement::Node(id) => &self.node(id).exception_handlers,
            GraphElement::Transition(id) => &self.transition(id).exception_handlers,
        }
    }

    /// `element` followed by its enclosing elements.
    pub fn element_chain(&self, element: GraphElement) -> Vec<GraphElement> {
        match element {
            GraphElement::Process => vec![GraphElement::Process],
            other => vec![other, GraphElement::Process],
        }
    }

    /// Human readable description of `element`.
    pub fn element_name(&self, element: GraphElement) -> String {
        match element {
            GraphElement::Process => format!("process '{}'", self.name),
            GraphElement::Node(id) => format!("node '{}'", self.node(id).name),
            GraphElement::Transition(id) => {
                let transition = self.transition(id);
                format!(
                    "transition '{}' ({} -> {})",
                    transition.name.as_deref().unwrap_or(""),
                    self.node(transition.from).name,
                    self.node(transition.to).name
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ProcessDefinition {
        let mut definition = ProcessDefinition::new("linear");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        let wait = definition.add_node("wait", NodeKind::State).unwrap();
        let end = definition.add_node("end", NodeKind::end()).unwrap();
        definition.add_transition(start, wait, None).unwrap();
        definition.add_transition(wait, end, Some("done")).unwrap();
        definition
    }

    #[test]
    fn test_build_linear_definition() {
        let definition = linear();
        assert_eq!(definition.nodes().len(), 3);
        assert_eq!(definition.transitions().len(), 2);
        assert_eq!(definition.start_node().unwrap().name, "start");

        let wait = definition.node_by_name("wait").unwrap();
        assert_eq!(wait.arriving(), &[0]);
        assert_eq!(definition.leaving_transition(wait.id, "done"), Some(1));
        assert_eq!(definition.leaving_transition(wait.id, "other"), None);
    }

    #[test]
    fn test_contains_checks_element_ids() {
        let definition = linear();
        assert!(definition.contains(GraphElement::Process));
        assert!(definition.contains(GraphElement::Node(2)));
        assert!(!definition.contains(GraphElement::Node(3)));
        assert!(definition.contains(GraphElement::Transition(1)));
        assert!(!definition.contains(GraphElement::Transition(2)));
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let mut definition = linear();
        assert!(matches!(
            definition.add_node("wait", NodeKind::State),
            Err(DefinitionError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_transition_must_stay_inside_definition() {
        let mut definition = linear();
        assert!(matches!(
            definition.add_transition(0, 42, None),
            Err(DefinitionError::UnknownElement(GraphElement::Node(42)))
        ));
    }

    #[test]
    fn test_default_leaving_transition() {
        let mut definition = linear();
        assert_eq!(definition.default_leaving_transition(0).unwrap(), 0);
        assert!(matches!(
            definition.default_leaving_transition(2),
            Err(EngineError::NoLeavingTransition { .. })
        ));

        definition.add_transition(1, 0, Some("back")).unwrap();
        assert!(matches!(
            definition.default_leaving_transition(1),
            Err(EngineError::AmbiguousTransition { count: 2, .. })
        ));
    }

    #[test]
    fn test_lock_mode_parsing() {
        assert_eq!("upgrade".parse::<JoinLockMode>().unwrap(), JoinLockMode::Upgrade);
        assert_eq!("READ".parse::<JoinLockMode>().unwrap(), JoinLockMode::Read);
        assert!("exclusive".parse::<JoinLockMode>().is_err());
        assert_eq!(JoinLockMode::Pessimistic.to_string(), "PESSIMISTIC");
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for name in ["node-enter", "after-signal", "subprocess-end", "audit"] {
            let event: EventType = name.parse().unwrap();
            assert_eq!(event.name(), name);
        }
    }

    #[test]
    fn test_element_chain_ends_at_process() {
        let definition = linear();
        assert_eq!(
            definition.element_chain(GraphElement::Node(1)),
            vec![GraphElement::Node(1), GraphElement::Process]
        );
        assert_eq!(
            definition.element_name(GraphElement::Transition(1)),
            "transition 'done' (wait -> end)"
        );
    }

    #[test]
    fn test_timer_spec_validates_durations() {
        assert!(TimerSpec::new("t", "2 business hours").is_ok());
        assert!(TimerSpec::new("t", "soon").is_err());
        assert!(TimerSpec::new("t", "1 hour").unwrap().with_repeat("often").is_err());
    }
}
