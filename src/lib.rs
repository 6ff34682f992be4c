//! Finite-state-machine runtime hosting many concurrent state machines on
//! a small number of worker threads.
//!
//! Two dispatch models are provided:
//!
//! * [`runner::DefinitionRunner`] — one worker thread per runner, driving
//!   a single FSM built from a data-only [`definition::Definition`].
//! * [`processor::Processor`] — one worker thread hosting many FSMs that
//!   implement [`reflective::ReflectiveFsm`], merging a FIFO event queue
//!   with an expiry-ordered timer queue.
//!
//! Both models share the same completion protocol ([`event::Completion`])
//! and the same construction-time error type ([`error::BuildError`]).
//!
//! # Author
//! Tony Przygienda, 2016
//!
//! # Panics
//! Never in normal operation; a debug assertion fires if a reflective
//! entry/exit handler mutates its FSM's state field.
//!
//! # Errors
//! Refer to [`error::BuildError`] for construction-time failures.
//!
//! # Copyrights
//!
//! Copyright (c) 2017, Juniper Networks, Inc.
//! All rights reserved.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! This code is not an official Juniper product.
//! You may obtain a copy of the License at
//!
//! http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate slog;

mod diagnostics;
pub mod definition;
pub mod dot_export;
pub mod error;
pub mod event;
pub mod processor;
pub mod reflective;
pub mod runner;

pub use definition::{AllStateEvent, Definition, Implementation, State, Transition};
pub use error::{ActionError, BuildError};
pub use event::{Completion, Event, EventEnvelope, Repeats, TimerSpec};
pub use processor::{FsmContext, FsmId, Processor, TimerHandle};
pub use reflective::{ClassInfo, ClassInfoBuilder, ReflectiveFsm};
pub use runner::DefinitionRunner;
