//! Event and completion protocol shared by both runners.
//!
//! Every value that can be enqueued to a worker carries a `Completion`: a
//! mutex-guarded flag plus a condvar that lets any producer thread block
//! until the worker marks the job done. Timer events additionally carry
//! expiry and repeat bookkeeping, modeled in `processor.rs` as a
//! `TimerEntry` built from a [`TimerSpec`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Number of times a timer re-fires after its first expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeats {
    /// Fire once, then mark done.
    Once,
    /// Fire `n + 1` times total, then mark done.
    Times(u32),
    /// Fire forever; never marked done until the timer is disabled.
    Infinite,
}

impl Repeats {
    /// Advance the repeat counter after one fire. Returns `true` if the
    /// timer is now exhausted (should be marked `done()`), `false` if it
    /// should be re-queued (the infinite case is never exhausted).
    pub fn tick(&mut self) -> bool {
        match self {
            Repeats::Once => true,
            Repeats::Infinite => false,
            Repeats::Times(0) => true,
            Repeats::Times(n) => {
                *n -= 1;
                false
            }
        }
    }
}

/// Completion signal shared between a producer and the worker that will
/// eventually dispatch the event.
///
/// `done()` is idempotent and `wait()` is safe to call from any number of
/// threads; both recheck the flag under the lock to guard against spurious
/// wakeups.
pub struct Completion {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Completion {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Mark this event done and wake every waiter. Safe to call more than
    /// once; the second call is a no-op.
    pub fn done(&self) {
        let mut done = self.state.lock().unwrap();
        if !*done {
            *done = true;
            self.cv.notify_all();
        }
    }

    /// Block until `done()` has been called at least once.
    pub fn wait(&self) {
        let mut done = self.state.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.lock().unwrap()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("is_done", &self.is_done())
            .finish()
    }
}

/// Marker trait for payloads that can travel through a [`crate::processor::Processor`].
///
/// Any `'static + Send + Debug` type automatically implements this; the
/// blanket impl is what lets the reflective dispatch table key handlers by
/// `TypeId` instead of a source-language "static type of the parameter".
pub trait Event: Any + Send + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + fmt::Debug> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A boxed event plus the completion it will be marked against, wrapped in
/// an `Arc` so a caller can retain a handle and re-push the identical
/// object. `Processor::push_event` compares `Arc` pointer identity against
/// the most recently enqueued item to implement the consecutive-duplicate
/// rule: resubmitting the same `Arc<EventEnvelope>` while it is still
/// queued is a no-op that hands back the existing completion instead of
/// enqueueing twice.
pub struct EventEnvelope {
    pub payload: Box<dyn Event>,
    pub completion: Arc<Completion>,
}

impl EventEnvelope {
    pub fn new(payload: Box<dyn Event>) -> Self {
        EventEnvelope {
            payload,
            completion: Arc::new(Completion::new()),
        }
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("payload", &self.payload)
            .field("done", &self.completion.is_done())
            .finish()
    }
}

/// Describes a timer to schedule: a factory producing the payload to
/// deliver on each fire (a factory rather than a single owned payload
/// since a repeating timer must deliver logically-the-same event more
/// than once), the delay until the first fire, the period between
/// subsequent fires, and how many times it repeats. Handed to
/// [`crate::processor::Processor::push_timer`], which turns it into a
/// live, cancellable timer and hands the caller back a
/// [`crate::processor::TimerHandle`].
pub struct TimerSpec {
    pub make_payload: Arc<dyn Fn() -> Box<dyn Event> + Send + Sync>,
    pub delay: Duration,
    pub period: Duration,
    pub repeats: Repeats,
}

impl TimerSpec {
    /// A one-shot timer firing once after `delay`.
    pub fn once(make_payload: Arc<dyn Fn() -> Box<dyn Event> + Send + Sync>, delay: Duration) -> Self {
        TimerSpec {
            make_payload,
            delay,
            period: Duration::from_secs(0),
            repeats: Repeats::Once,
        }
    }

    /// A timer firing after `delay`, then every `period` thereafter per
    /// `repeats`.
    pub fn repeating(
        make_payload: Arc<dyn Fn() -> Box<dyn Event> + Send + Sync>,
        delay: Duration,
        period: Duration,
        repeats: Repeats,
    ) -> Self {
        TimerSpec {
            make_payload,
            delay,
            period,
            repeats,
        }
    }
}
