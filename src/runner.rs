//! Definition Runner: a worker thread that owns one FSM instance built from
//! a [`Definition`] and an [`Implementation`], and drives it from a FIFO
//! event stream.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use slog::Logger;

use crate::definition::{
    entry_name, exit_name, Definition, Implementation, Transition, DEFAULT_EVENT, INVALID_EVENT,
    TERMINATE_EVENT,
};
use crate::error::{ActionError, BuildError};

#[derive(Debug, Clone)]
struct ResolvedTransition {
    to_state: String,
    action_name: Option<String>,
}

impl ResolvedTransition {
    fn from(t: &Transition) -> Self {
        ResolvedTransition {
            to_state: t.to_state.clone(),
            action_name: if t.action_name.is_empty() {
                None
            } else {
                Some(t.action_name.clone())
            },
        }
    }
}

/// Per-state dispatch: keyed transitions plus optional entry/exit/default.
struct StateTable {
    transitions: HashMap<i64, ResolvedTransition>,
    entry: Option<String>,
    exit: Option<String>,
}

enum RunnerJob {
    Event(i64),
    Terminate,
}

/// Owns the worker thread and lets callers push events and request a
/// graceful or immediate shutdown.
pub struct DefinitionRunner {
    name: String,
    sender: mpsc::Sender<RunnerJob>,
    shutdown_requested: Arc<std::sync::atomic::AtomicBool>,
    shutdown_events: Vec<i64>,
    worker: Option<JoinHandle<Result<(), ActionError>>>,
    current_state: Arc<Mutex<String>>,
}

impl DefinitionRunner {
    /// Build the dispatch tables from `def`, binding action/entry/exit
    /// names against `implementation.operations()`, and launch the worker
    /// thread. Fails fast (before any thread is spawned) if a transition's
    /// action name isn't declared by the implementation.
    pub fn new<I>(
        def: Definition,
        mut implementation: I,
        name: impl Into<String>,
        log: Logger,
    ) -> Result<Self, BuildError>
    where
        I: Implementation + 'static,
    {
        def.validate()?;
        let name = name.into();
        let ops: std::collections::HashSet<String> = implementation.operations().into_iter().collect();

        let mut tables: HashMap<String, StateTable> = def
            .states
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    StateTable {
                        transitions: HashMap::new(),
                        entry: if ops.contains(&entry_name(&s.name)) {
                            Some(entry_name(&s.name))
                        } else {
                            None
                        },
                        exit: if ops.contains(&exit_name(&s.name)) {
                            Some(exit_name(&s.name))
                        } else {
                            None
                        },
                    },
                )
            })
            .collect();

        for t in &def.transitions {
            if !t.action_name.is_empty() && !ops.contains(&t.action_name) {
                return Err(BuildError::MissingOperation(t.action_name.clone()));
            }
            let table = tables.get_mut(&t.from_state).expect("validated state");
            if table.transitions.contains_key(&t.event_id) {
                return Err(BuildError::DuplicateHandler {
                    state: t.from_state.clone(),
                    event: t.event_id.to_string(),
                });
            }
            table
                .transitions
                .insert(t.event_id, ResolvedTransition::from(t));
        }

        for g in &def.global_events {
            if !g.action_name.is_empty() && !ops.contains(&g.action_name) {
                return Err(BuildError::MissingOperation(g.action_name.clone()));
            }
            for s in &def.states {
                let table = tables.get_mut(&s.name).unwrap();
                table.transitions.entry(g.event_id).or_insert_with(|| ResolvedTransition {
                    to_state: s.name.clone(),
                    action_name: if g.action_name.is_empty() {
                        None
                    } else {
                        Some(g.action_name.clone())
                    },
                });
            }
        }

        let (tx, rx) = mpsc::channel::<RunnerJob>();
        let shutdown_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let current_state = Arc::new(Mutex::new(def.first_state.clone()));

        let worker_current_state = current_state.clone();
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("definition-runner-{}", name))
            .spawn(move || {
                run_worker(rx, tables, implementation, worker_current_state, worker_name, log)
            })
            .expect("failed to spawn runner worker thread");

        Ok(DefinitionRunner {
            name,
            sender: tx,
            shutdown_requested,
            shutdown_events: def.shutdown_events.clone(),
            worker: Some(worker),
            current_state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state(&self) -> String {
        self.current_state.lock().unwrap().clone()
    }

    /// Enqueue `event_id`. Returns `false` (not admitted) once `stop()` has
    /// been called.
    pub fn push_event(&self, event_id: i64) -> bool {
        if self.shutdown_requested.load(std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        self.sender.send(RunnerJob::Event(event_id)).is_ok()
    }

    /// Request a graceful shutdown: posts every configured shutdown event
    /// in order, then the terminate sentinel. Further `push_event` calls
    /// are rejected immediately.
    pub fn stop(&self) {
        if self
            .shutdown_requested
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        for id in &self.shutdown_events {
            let _ = self.sender.send(RunnerJob::Event(*id));
        }
        let _ = self.sender.send(RunnerJob::Terminate);
    }

    /// Join the worker thread, propagating a handler failure if one
    /// occurred.
    pub fn dispose(mut self) -> Result<(), ActionError> {
        self.stop();
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => Ok(()), // worker panicked; nothing more to report here
            }
        } else {
            Ok(())
        }
    }
}

fn run_worker<I: Implementation>(
    rx: mpsc::Receiver<RunnerJob>,
    tables: HashMap<String, StateTable>,
    mut implementation: I,
    current_state: Arc<Mutex<String>>,
    name: String,
    log: Logger,
) -> Result<(), ActionError> {
    debug!(log, "runner {} starting in state {}", name, current_state.lock().unwrap());

    while let Ok(job) = rx.recv() {
        let event_id = match job {
            RunnerJob::Terminate => break,
            RunnerJob::Event(id) => id,
        };
        dispatch_one(&tables, &mut implementation, &current_state, &name, &log, event_id)?;
    }

    debug!(log, "runner {} terminated in state {}", name, current_state.lock().unwrap());
    Ok(())
}

fn dispatch_one<I: Implementation>(
    tables: &HashMap<String, StateTable>,
    implementation: &mut I,
    current_state: &Arc<Mutex<String>>,
    name: &str,
    log: &Logger,
    incoming: i64,
) -> Result<(), ActionError> {
    let mut ev = incoming;
    loop {
        let state = current_state.lock().unwrap().clone();
        let table = tables.get(&state).expect("state always present");
        if let Some(t) = table.transitions.get(&ev).cloned() {
            run_transition(tables, implementation, current_state, name, log, &t, ev)?;
            run_default_chain(tables, implementation, current_state, name, log)?;
            break;
        } else if let Some(t) = table.transitions.get(&DEFAULT_EVENT).cloned() {
            let prev = state.clone();
            run_transition(tables, implementation, current_state, name, log, &t, ev)?;
            if *current_state.lock().unwrap() == prev {
                break;
            }
            // ev unchanged: re-evaluate the original event against the new state
        } else {
            debug!(log, "runner {} dropping unhandled event {} in state {}", name, ev, state);
            ev = INVALID_EVENT;
            break;
        }
    }
    Ok(())
}

fn run_default_chain<I: Implementation>(
    tables: &HashMap<String, StateTable>,
    implementation: &mut I,
    current_state: &Arc<Mutex<String>>,
    name: &str,
    log: &Logger,
) -> Result<(), ActionError> {
    loop {
        let state = current_state.lock().unwrap().clone();
        let table = tables.get(&state).unwrap();
        match table.transitions.get(&DEFAULT_EVENT).cloned() {
            Some(t) => {
                let prev = state.clone();
                run_transition(tables, implementation, current_state, name, log, &t, DEFAULT_EVENT)?;
                if *current_state.lock().unwrap() == prev {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(())
}

/// exit(current) -> action -> state assignment -> StateChanged -> entry(new).
/// Runs unconditionally, even for a self-loop (`to_state == from_state`):
/// the spec's global-event example fires `GreenExit, Reset, GreenEntry` for
/// a self-loop transition, so there is no "did the state actually change"
/// gate here.
fn run_transition<I: Implementation>(
    tables: &HashMap<String, StateTable>,
    implementation: &mut I,
    current_state: &Arc<Mutex<String>>,
    name: &str,
    log: &Logger,
    t: &ResolvedTransition,
    event_id: i64,
) -> Result<(), ActionError> {
    let from = current_state.lock().unwrap().clone();

    if let Some(exit) = &tables.get(&from).unwrap().exit {
        trace!(log, "runner {} exit {}", name, from);
        implementation.invoke(exit, event_id)?;
    }

    if let Some(action) = &t.action_name {
        trace!(log, "runner {} action {} on event {}", name, action, event_id);
        implementation.invoke(action, event_id)?;
    }

    *current_state.lock().unwrap() = t.to_state.clone();

    debug!(log, "runner {} StateChanged -> {}", name, t.to_state);
    if let Some(entry) = &tables.get(&t.to_state).unwrap().entry {
        trace!(log, "runner {} entry {}", name, t.to_state);
        implementation.invoke(entry, event_id)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AllStateEvent, Definition, Transition};
    use std::sync::{Arc, Mutex};

    struct TrafficLight {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Implementation for TrafficLight {
        fn operations(&self) -> Vec<String> {
            vec![
                "RedStateEntry".into(),
                "RedStateExit".into(),
                "GreenStateEntry".into(),
                "GreenStateExit".into(),
                "YellowStateEntry".into(),
                "YellowStateExit".into(),
                "GoGreen".into(),
                "GoYellow".into(),
                "GoRed".into(),
                "Reset".into(),
            ]
        }

        fn invoke(&mut self, op: &str, _event_id: i64) -> Result<(), ActionError> {
            self.log.lock().unwrap().push(op.to_string());
            Ok(())
        }
    }

    fn test_logger() -> Logger {
        crate::diagnostics::test_logger()
    }

    fn build_def() -> Definition {
        Definition::new("Red")
            .with_state("Red")
            .with_state("Green")
            .with_state("Yellow")
            .with_transition(Transition::new("Red", 1, "Green", "GoGreen"))
            .with_transition(Transition::new("Green", 2, "Yellow", "GoYellow"))
            .with_transition(Transition::new("Yellow", 3, "Red", "GoRed"))
    }

    #[test]
    fn traffic_light_sequence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let def = build_def();
        let runner = DefinitionRunner::new(
            def,
            TrafficLight { log: log.clone() },
            "traffic",
            test_logger(),
        )
        .unwrap();

        assert!(runner.push_event(1));
        assert!(runner.push_event(2));
        assert!(runner.push_event(3));
        runner.dispose().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "RedStateExit",
                "GoGreen",
                "GreenStateEntry",
                "GreenStateExit",
                "GoYellow",
                "YellowStateEntry",
                "YellowStateExit",
                "GoRed",
                "RedStateEntry",
            ]
        );
    }

    #[test]
    fn global_event_self_loop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let def = build_def().with_global_event(AllStateEvent::new(9, "Reset"));
        let runner = DefinitionRunner::new(
            def,
            TrafficLight { log: log.clone() },
            "traffic",
            test_logger(),
        )
        .unwrap();

        assert!(runner.push_event(1));
        assert!(runner.push_event(9));
        runner.dispose().unwrap();

        let entries = log.lock().unwrap();
        assert_eq!(
            *entries,
            vec![
                "RedStateExit",
                "GoGreen",
                "GreenStateEntry",
                // self-loop on Green still runs exit, action, entry
                "GreenStateExit",
                "Reset",
                "GreenStateEntry",
            ]
        );
        assert_eq!(runner.current_state(), "Green");
    }

    #[test]
    fn push_event_rejected_after_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let def = build_def();
        let runner =
            DefinitionRunner::new(def, TrafficLight { log }, "traffic", test_logger()).unwrap();
        runner.stop();
        assert!(!runner.push_event(1));
    }

    struct SelfLoopDefaultImpl;
    impl Implementation for SelfLoopDefaultImpl {
        fn operations(&self) -> Vec<String> {
            vec![]
        }
        fn invoke(&mut self, _op: &str, _event_id: i64) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[test]
    fn default_self_loop_does_not_livelock() {
        // A state whose only transition is a default that loops to itself
        // with no action must terminate the inner dispatch loop rather
        // than spin forever.
        let def = Definition::new("Idle")
            .with_state("Idle")
            .with_transition(Transition::new("Idle", 0, "Idle", ""));
        let runner =
            DefinitionRunner::new(def, SelfLoopDefaultImpl, "idle", test_logger()).unwrap();
        assert!(runner.push_event(42));
        runner.dispose().unwrap();
    }

    #[test]
    fn build_fails_on_missing_action_operation() {
        let def = Definition::new("Red")
            .with_state("Red")
            .with_state("Green")
            .with_transition(Transition::new("Red", 1, "Green", "NoSuchOp"));
        let err = DefinitionRunner::new(def, SelfLoopDefaultImpl, "x", test_logger()).unwrap_err();
        assert_eq!(err, BuildError::MissingOperation("NoSuchOp".into()));
    }
}
