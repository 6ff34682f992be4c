//! Declarative FSM description consumed by the [`crate::runner::DefinitionRunner`].
//!
//! A `Definition` is pure data: states, transitions keyed by event id, an
//! optional set of any-state events, and the ordered events a graceful
//! shutdown should post before the runner terminates. Binding names to
//! actual handler calls happens at [`crate::runner::DefinitionRunner`]
//! construction time against an [`Implementation`].

use std::collections::HashMap;

use crate::error::BuildError;

/// `event_id = 0` marks the default transition; re-checked after every
/// transition while one is present for the current state.
pub const DEFAULT_EVENT: i64 = 0;
/// Requests runner termination.
pub const TERMINATE_EVENT: i64 = -1;
/// Sentinel meaning "no event currently being processed"; never posted by
/// a caller.
pub const INVALID_EVENT: i64 = -2;

/// A named state. Identity is by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct State {
    pub name: String,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        State { name: name.into() }
    }
}

/// A single `(from, event) -> to` edge, with the name of the action to run
/// while transitioning. `action_name` may be empty to mean "no action, just
/// move the state".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub event_id: i64,
    pub action_name: String,
}

impl Transition {
    pub fn new(
        from_state: impl Into<String>,
        event_id: i64,
        to_state: impl Into<String>,
        action_name: impl Into<String>,
    ) -> Self {
        Transition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            event_id,
            action_name: action_name.into(),
        }
    }
}

/// Installs a self-loop transition on every state for `event_id`, unless
/// that state already declares its own handler for the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllStateEvent {
    pub event_id: i64,
    pub action_name: String,
}

impl AllStateEvent {
    pub fn new(event_id: i64, action_name: impl Into<String>) -> Self {
        AllStateEvent {
            event_id,
            action_name: action_name.into(),
        }
    }
}

/// The full declarative graph for a Definition Runner.
#[derive(Debug, Clone)]
pub struct Definition {
    pub first_state: String,
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    pub global_events: Vec<AllStateEvent>,
    pub shutdown_events: Vec<i64>,
}

impl Definition {
    pub fn new(first_state: impl Into<String>) -> Self {
        Definition {
            first_state: first_state.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            global_events: Vec::new(),
            shutdown_events: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.states.push(State::new(state));
        self
    }

    pub fn with_transition(mut self, t: Transition) -> Self {
        self.transitions.push(t);
        self
    }

    pub fn with_global_event(mut self, e: AllStateEvent) -> Self {
        self.global_events.push(e);
        self
    }

    pub fn with_shutdown_event(mut self, event_id: i64) -> Self {
        self.shutdown_events.push(event_id);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.states.is_empty() {
            return Err(BuildError::EmptyDefinition);
        }
        let names: std::collections::HashSet<&str> =
            self.states.iter().map(|s| s.name.as_str()).collect();
        if !names.contains(self.first_state.as_str()) {
            return Err(BuildError::UnknownFirstState(self.first_state.clone()));
        }
        for t in &self.transitions {
            if t.event_id == TERMINATE_EVENT || t.event_id == INVALID_EVENT {
                return Err(BuildError::ReservedEventId(t.event_id));
            }
            if !names.contains(t.from_state.as_str()) {
                return Err(BuildError::UnknownState(t.from_state.clone()));
            }
            if !names.contains(t.to_state.as_str()) {
                return Err(BuildError::UnknownState(t.to_state.clone()));
            }
        }
        Ok(())
    }
}

/// The external collaborator a Definition Runner drives: an object exposing
/// named operations that entry/exit/transition actions are bound to by
/// string lookup at construction time.
///
/// `operations()` is consulted at build time only, to fail construction
/// fast when a Definition references a name the implementation doesn't
/// declare; `invoke` is the runtime dispatch path.
pub trait Implementation: Send {
    /// The full set of operation names this implementation answers to.
    /// Entry/exit names follow the `"<StateName>StateEntry"` /
    /// `"<StateName>StateExit"` convention; action names are whatever the
    /// Definition's transitions declare.
    fn operations(&self) -> Vec<String>;

    /// Invoke the named operation for the given event id. Returning `Err`
    /// terminates the owning runner.
    fn invoke(&mut self, op: &str, event_id: i64) -> Result<(), crate::error::ActionError>;
}

pub(crate) fn entry_name(state: &str) -> String {
    format!("{}StateEntry", state)
}

pub(crate) fn exit_name(state: &str) -> String {
    format!("{}StateExit", state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_unknown_first_state() {
        let def = Definition::new("Nope").with_state("Red");
        assert_eq!(
            def.validate(),
            Err(BuildError::UnknownFirstState("Nope".into()))
        );
    }

    #[test]
    fn validate_rejects_reserved_event_id() {
        let def = Definition::new("Red")
            .with_state("Red")
            .with_state("Green")
            .with_transition(Transition::new("Red", TERMINATE_EVENT, "Green", "go"));
        assert_eq!(def.validate(), Err(BuildError::ReservedEventId(-1)));
    }

    #[test]
    fn validate_rejects_unknown_transition_state() {
        let def = Definition::new("Red")
            .with_state("Red")
            .with_transition(Transition::new("Red", 1, "Green", "go"));
        assert_eq!(def.validate(), Err(BuildError::UnknownState("Green".into())));
    }
}
