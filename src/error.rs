//! Construction-time error types.
//!
//! Non-fatal runtime conditions (an unhandled event, dispatch to an
//! unregistered FSM id) are deliberately *not* represented here: they are
//! logged and dropped by the worker, rather than forced through a
//! `Result` the caller would have to thread back out of a detached
//! worker thread.

use thiserror::Error;

/// Failures that can occur while building a [`crate::runner::DefinitionRunner`]
/// or a reflective `ClassInfo`. All are fatal at construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("transition references unknown state `{0}`")]
    UnknownState(String),

    #[error("no implementation operation named `{0}`")]
    MissingOperation(String),

    #[error("duplicate handler for state `{state}` event `{event}`")]
    DuplicateHandler { state: String, event: String },

    #[error("event id {0} is reserved and cannot be used by a transition")]
    ReservedEventId(i64),

    #[error("definition has no states")]
    EmptyDefinition,

    #[error("first_state `{0}` is not one of the definition's states")]
    UnknownFirstState(String),
}

/// Raised from a Definition Runner worker when a handler invocation fails;
/// propagated to the worker's failure channel and terminates the runner.
#[derive(Debug, Error)]
#[error("handler `{action}` failed: {message}")]
pub struct ActionError {
    pub action: String,
    pub message: String,
}
