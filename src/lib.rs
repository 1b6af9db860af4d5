// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A structured-concurrency effect runtime.
//!
//! An [`Effect<A, E>`] describes a computation that either produces a value
//! of type `A` or fails with a [`cause::Cause<E>`] — a typed failure, an
//! untyped defect, or structured interruption — without running anything
//! until it's handed to a [`runtime::Runtime`]. Effects compose into fiber
//! trees: forking ([`Effect::fork`]) creates a structured child whose
//! lifetime nests inside its parent's (or an explicit [`scope::Scope`]'s, via
//! [`Effect::fork_in`]); [`scope::acquire_release`] ties resource cleanup to
//! that same structure so release always runs, regardless of how the scope
//! exits. [`concurrency`] builds racing, bounded/unbounded mapping, and
//! FIFO-waiter primitives on top of the same fiber/effect vocabulary.
//!
//! Everything here runs on one cooperative, single-threaded scheduler per
//! [`runtime::Runtime`] — there is no implicit multithreading, and nothing
//! blocks except the explicit `run_promise*` entry points, which advance real
//! time themselves to fire pending timers.

pub mod cause;
pub mod clock;
pub mod concurrency;
pub mod context;
pub mod effect;
pub mod error;
pub mod exit;
mod fiber;
pub mod fiber_ref;
pub mod id;
mod node;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod time;

pub use cause::Cause;
pub use effect::Effect;
pub use exit::Exit;
pub use fiber_ref::FiberRef;
pub use runtime::Runtime;
pub use scope::{acquire_release, Scope};
