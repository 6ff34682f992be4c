//! Reflective FSM base.
//!
//! Each concrete FSM type discovers its own states, entry/exit handlers
//! and transitions once, then caches the result keyed by class identity.
//! Rust has no runtime reflection, so discovery is an explicit
//! registration call rather than name-based or tag-based introspection:
//! a concrete type implements [`ReflectiveFsm`]
//! and its `build_class_info()` registers handlers through [`ClassInfoBuilder`].
//! The resulting [`ClassInfo`] is cached process-wide keyed by [`TypeId`],
//! built once and read lock-free afterward.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use crate::error::BuildError;
use crate::event::Event;
use crate::processor::FsmContext;

/// Placeholder event handed to entry handlers invoked outside of any real
/// dispatch (the Processor's `EnterFirstState` / `OnEntry` callbacks).
#[derive(Debug)]
pub struct AdmissionEvent;

type Handler<F> = Box<dyn Fn(&mut F, &dyn Event) + Send + Sync>;
type EntryHandler<F> = Box<dyn Fn(&mut F, &dyn Event, <F as ReflectiveFsm>::State) + Send + Sync>;

struct StateInfo<F: ReflectiveFsm> {
    entry: Option<EntryHandler<F>>,
    exit: Option<Handler<F>>,
    default_transition: Option<Handler<F>>,
    transitions: HashMap<TypeId, Handler<F>>,
}

impl<F: ReflectiveFsm> Default for StateInfo<F> {
    fn default() -> Self {
        StateInfo {
            entry: None,
            exit: None,
            default_transition: None,
            transitions: HashMap::new(),
        }
    }
}

/// The dispatch table for one concrete FSM type: per-state entry/exit and
/// transitions, plus class-level (any-state) event handlers.
pub struct ClassInfo<F: ReflectiveFsm> {
    states: HashMap<F::State, StateInfo<F>>,
    class_handlers: HashMap<TypeId, Handler<F>>,
}

/// Fluent builder for a [`ClassInfo`]. Errors (duplicate handlers) are
/// deferred to [`ClassInfoBuilder::build`] so registration reads as a
/// single chained expression.
pub struct ClassInfoBuilder<F: ReflectiveFsm> {
    states: HashMap<F::State, StateInfo<F>>,
    class_handlers: HashMap<TypeId, Handler<F>>,
    errors: Vec<BuildError>,
}

impl<F: ReflectiveFsm> ClassInfoBuilder<F> {
    pub fn new() -> Self {
        ClassInfoBuilder {
            states: HashMap::new(),
            class_handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn entry_for(&mut self, state: F::State) -> &mut StateInfo<F> {
        self.states.entry(state).or_insert_with(StateInfo::default)
    }

    pub fn on_entry(
        mut self,
        state: F::State,
        f: impl Fn(&mut F, &dyn Event, F::State) + Send + Sync + 'static,
    ) -> Self {
        self.entry_for(state).entry = Some(Box::new(f));
        self
    }

    pub fn on_exit(mut self, state: F::State, f: impl Fn(&mut F, &dyn Event) + Send + Sync + 'static) -> Self {
        self.entry_for(state).exit = Some(Box::new(f));
        self
    }

    pub fn on_default(
        mut self,
        state: F::State,
        f: impl Fn(&mut F, &dyn Event) + Send + Sync + 'static,
    ) -> Self {
        self.entry_for(state).default_transition = Some(Box::new(f));
        self
    }

    /// Register a transition keyed by the concrete event type `E` for
    /// `state`. At most one handler may be registered per `(state, E)`
    /// pair; a second registration is reported as a `BuildError` from
    /// `build()`.
    pub fn on_event<E: Event>(
        mut self,
        state: F::State,
        f: impl Fn(&mut F, &dyn Event) + Send + Sync + 'static,
    ) -> Self {
        let type_id = TypeId::of::<E>();
        let info = self.entry_for(state);
        if info.transitions.contains_key(&type_id) {
            self.errors.push(BuildError::DuplicateHandler {
                state: format!("{:?}", state),
                event: std::any::type_name::<E>().to_string(),
            });
            return self;
        }
        info.transitions.insert(type_id, Box::new(f));
        self
    }

    /// Register a class-level (any-state) handler for event type `E`,
    /// used only when no per-state transition or default matched.
    pub fn on_class_event<E: Event>(
        mut self,
        f: impl Fn(&mut F, &dyn Event) + Send + Sync + 'static,
    ) -> Self {
        self.class_handlers.insert(TypeId::of::<E>(), Box::new(f));
        self
    }

    pub fn build(self) -> Result<ClassInfo<F>, BuildError> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }
        Ok(ClassInfo {
            states: self.states,
            class_handlers: self.class_handlers,
        })
    }
}

impl<F: ReflectiveFsm> Default for ClassInfoBuilder<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract for an FSM hosted by a [`crate::processor::Processor`].
///
/// `State` must be a small `Copy` enum; `context_mut`/`context` expose the
/// [`FsmContext`] slot the Processor fills in on admission, giving the FSM
/// the ability to post events/timers against itself without owning its
/// host.
pub trait ReflectiveFsm: Send + 'static {
    type State: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);

    fn context_mut(&mut self) -> &mut FsmContext;
    fn context(&self) -> &FsmContext;

    /// Build this type's dispatch table. Called at most once per concrete
    /// type, under the class-cache lock, and the result is reused for
    /// every instance thereafter.
    fn build_class_info() -> ClassInfo<Self>
    where
        Self: Sized;

    /// Runs once on admission, before `EnterFirstState`. Default: no-op.
    fn on_entry(&mut self) {}
    /// Runs once on termination, after the FSM is unregistered from
    /// dispatch. Default: no-op.
    fn on_exit(&mut self) {}
    /// Runs when no transition, default, or class handler matched.
    /// Default: no-op (the Processor still logs the drop).
    fn on_event_default(&mut self, _event: &dyn Event) {}
}

static CLASS_CACHE: OnceLock<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> = OnceLock::new();

/// Returns the cached `ClassInfo<F>`, building it on first call for `F`.
pub fn class_info<F: ReflectiveFsm>() -> Arc<ClassInfo<F>> {
    let cache = CLASS_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap();
    let type_id = TypeId::of::<F>();
    if let Some(existing) = guard.get(&type_id) {
        return existing
            .clone()
            .downcast::<ClassInfo<F>>()
            .expect("class cache type invariant");
    }
    // A registration bug (duplicate handler) is a programmer error caught
    // the first time this FSM type is ever admitted; `build_class_info`
    // is expected to `.build().expect(...)` internally rather than thread
    // a `Result` through every call site that hosts an FSM.
    let info: Arc<ClassInfo<F>> = Arc::new(F::build_class_info());
    guard.insert(type_id, info.clone() as Arc<dyn Any + Send + Sync>);
    info
}

/// Dispatch one event against `fsm` using `info`. Asserts (debug-only)
/// that entry/exit handlers do not mutate the state field themselves.
/// Returns `false` when nothing but `on_event_default` matched, so the
/// host can log the drop.
pub(crate) fn dispatch<F: ReflectiveFsm>(fsm: &mut F, info: &ClassInfo<F>, event: &dyn Event) -> bool {
    let s1 = fsm.state();
    let type_id = event.as_any().type_id();

    let state_info = match info.states.get(&s1) {
        Some(si) => si,
        None => {
            if let Some(handler) = info.class_handlers.get(&type_id) {
                handler(fsm, event);
                return true;
            }
            fsm.on_event_default(event);
            return false;
        }
    };

    if let Some(handler) = state_info.transitions.get(&type_id) {
        if let Some(exit) = &state_info.exit {
            exit(fsm, event);
            debug_assert_eq!(fsm.state(), s1, "exit handler must not mutate state");
        }
        handler(fsm, event);
        let s2 = fsm.state();
        if s2 != s1 {
            if let Some(info2) = info.states.get(&s2) {
                if let Some(entry) = &info2.entry {
                    entry(fsm, event, s1);
                    debug_assert_eq!(fsm.state(), s2, "entry handler must not mutate state");
                }
            }
        } else if let Some(entry) = &state_info.entry {
            entry(fsm, event, s1);
            debug_assert_eq!(fsm.state(), s1, "entry handler must not mutate state");
        }
        true
    } else if let Some(default) = &state_info.default_transition {
        default(fsm, event);
        true
    } else if let Some(handler) = info.class_handlers.get(&type_id) {
        handler(fsm, event);
        true
    } else {
        fsm.on_event_default(event);
        false
    }
}

pub(crate) fn enter_first_state<F: ReflectiveFsm>(fsm: &mut F, info: &ClassInfo<F>) {
    let s = fsm.state();
    if let Some(state_info) = info.states.get(&s) {
        if let Some(entry) = &state_info.entry {
            entry(fsm, &AdmissionEvent, s);
        }
    }
}

/// Object-safe façade over `ReflectiveFsm` so the Processor can hold
/// heterogeneous FSM types behind one `Box<dyn Dispatchable>`.
pub(crate) trait Dispatchable: Send {
    /// Returns `false` when the event matched nothing but `on_event_default`.
    fn dispatch_event(&mut self, event: &dyn Event) -> bool;
    fn run_on_entry(&mut self);
    fn run_on_exit(&mut self);
    fn run_enter_first_state(&mut self);
    fn context_mut(&mut self) -> &mut FsmContext;
}

impl<F: ReflectiveFsm> Dispatchable for F {
    fn dispatch_event(&mut self, event: &dyn Event) -> bool {
        let info = class_info::<F>();
        dispatch(self, &info, event)
    }

    fn run_on_entry(&mut self) {
        ReflectiveFsm::on_entry(self);
    }

    fn run_on_exit(&mut self) {
        ReflectiveFsm::on_exit(self);
    }

    fn run_enter_first_state(&mut self) {
        let info = class_info::<F>();
        enter_first_state(self, &info);
    }

    fn context_mut(&mut self) -> &mut FsmContext {
        ReflectiveFsm::context_mut(self)
    }
}
