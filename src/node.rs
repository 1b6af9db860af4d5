// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The untyped effect IR the interpreter actually walks.
//!
//! [`crate::effect::Effect<A, E>`] is a thin, statically-typed facade: every
//! combinator on it builds one of these [`Node`]s and immediately forgets `A`
//! and `E`, because a single fiber's continuation stack is, by construction,
//! heterogeneous in the success type at every `OnSuccess` boundary (a `flat_map`
//! changes what "success" means partway down the stack). Rather than encode an
//! existential per combinator, we erase success values to `Box<dyn Any>` and
//! failure payloads to the same via [`RawCause`], and let `Effect<A, E>`'s
//! `PhantomData` carry the compile-time guarantee that a *complete* effect
//! produces the types its signature promises. This is the same trick a tree-
//! walking interpreter for a dynamically typed source language uses in any
//! statically typed host: erase in the middle, recover types at the edges.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::cause::RawCause;
use crate::exit::RawExit;
use crate::fiber::Fiber;

pub(crate) type BoxAny = Box<dyn Any>;

/// The outcome of evaluating one primitive: either it produced a value/cause
/// directly, or it needs the fiber to suspend until something external resumes
/// it.
pub(crate) enum Outcome {
    Success(BoxAny),
    Failure(RawCause),
}

impl Outcome {
    pub(crate) fn into_node(self) -> Node {
        match self {
            Outcome::Success(v) => Node::Succeed(v),
            Outcome::Failure(c) => Node::FailCause(c),
        }
    }

    pub(crate) fn from_exit(exit: RawExit) -> Self {
        match exit {
            RawExit::Success(v) => Outcome::Success(v),
            RawExit::Failure(c) => Outcome::Failure(c),
        }
    }
}

/// A callback an `Async` primitive's registration function receives; calling it
/// resumes the fiber with the given outcome, either synchronously (before
/// registration returns, meaning the fiber never actually suspends) or later
/// from arbitrary scheduler-visible code (a timer, an I/O completion, another
/// fiber).
pub struct Resume {
    pub(crate) inner: Box<dyn FnOnce(Outcome)>,
}

impl Resume {
    pub(crate) fn new(inner: Box<dyn FnOnce(Outcome)>) -> Self {
        Self { inner }
    }

    pub(crate) fn succeed(self, value: BoxAny) {
        (self.inner)(Outcome::Success(value));
    }

    pub(crate) fn fail_cause(self, cause: RawCause) {
        (self.inner)(Outcome::Failure(cause));
    }
}

/// An opaque handle an `Async` registration may return to allow the fiber to
/// request early cancellation of the pending operation (e.g. when the fiber is
/// interrupted while suspended). Dropping it without calling is a no-op.
pub struct Canceler {
    pub(crate) inner: Box<dyn FnOnce()>,
}

impl Canceler {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self { inner: Box::new(f) }
    }

    pub(crate) fn cancel(self) {
        (self.inner)();
    }
}

/// The untyped primitive algebra. One variant per bullet in the effect value's
/// primitive list; everything else (`map`, `flatMap`, `catch`, `zip`, ...) is
/// sugar built from these in `effect.rs`.
pub(crate) enum Node {
    Succeed(BoxAny),
    FailCause(RawCause),
    Sync(Box<dyn FnOnce() -> BoxAny>),
    Suspend(Box<dyn FnOnce() -> Node>),
    Async(Box<dyn FnOnce(&mut Fiber, Resume) -> Option<Canceler>>),
    WithFiber(Box<dyn FnOnce(&mut Fiber) -> Node>),
    OnSuccess(Box<Node>, Box<dyn FnOnce(BoxAny) -> Node>),
    OnFailure(Box<Node>, Box<dyn FnOnce(RawCause) -> Node>),
    OnSuccessAndFailure(Box<Node>, Box<dyn FnOnce(BoxAny) -> Node>, Box<dyn FnOnce(RawCause) -> Node>),
    SetInterruptible(bool, Box<Node>),
    /// Runs the wrapped node with a different `Context` bound on the fiber,
    /// restoring the previous one afterward. Backs `Effect::provide`/
    /// `provide_reference`.
    WithContext(crate::context::Context, Box<Node>),
    /// Runs `on_cancel` before re-propagating any *interrupting* failure that
    /// passes through while interruptibility is temporarily suppressed.
    AsyncFinalizer(Box<dyn FnOnce() -> Node>, Box<Node>),
    Yield,
    While {
        cond: Box<dyn FnMut() -> bool>,
        body: Box<dyn FnMut() -> Node>,
    },
    /// Sequentially drives a Rust iterator of effect nodes to completion,
    /// accumulating each success and short-circuiting on the first failure.
    /// The building block behind sequential `forEach`/`Effect::all`.
    Iterator(Box<dyn Iterator<Item = Node>>, Vec<BoxAny>),
}

impl Node {
    pub(crate) fn from_outcome(outcome: Outcome) -> Node {
        outcome.into_node()
    }

    /// Runs a plain closure, converting a Rust panic into a `Die` the same way
    /// `Effect::sync`'s contract requires (panics are defects, not expected
    /// failures).
    pub(crate) fn run_catching<T>(f: impl FnOnce() -> T) -> Result<T, RawCause> {
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| RawCause::die(payload))
    }
}

/// One entry on a fiber's continuation stack. Each frame is either a plain
/// success/failure handler (the result of `OnSuccess`/`OnFailure`/
/// `OnSuccessAndFailure`) or a bracketing frame that runs on *every* pop
/// regardless of outcome kind (`SetInterruptible`, `AsyncFinalizer`).
pub(crate) enum Frame {
    OnSuccess(Box<dyn FnOnce(BoxAny) -> Node>),
    OnFailure(Box<dyn FnOnce(RawCause) -> Node>),
    OnSuccessAndFailure(Box<dyn FnOnce(BoxAny) -> Node>, Box<dyn FnOnce(RawCause) -> Node>),
    SetInterruptible(bool),
    RestoreContext(crate::context::Context),
    AsyncFinalizer(Box<dyn FnOnce() -> Node>),
}
