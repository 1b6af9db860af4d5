// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Exit`]: the terminal result of running a fiber to completion.

use std::any::Any;
use std::fmt;

use crate::cause::{Cause, RawCause};

type BoxAny = Box<dyn Any>;

/// Type-erased terminal outcome, as produced by the interpreter. See [`Exit`]
/// for the typed facade.
#[derive(Debug)]
pub(crate) enum RawExit {
    Success(BoxAny),
    Failure(RawCause),
}

impl RawExit {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, RawExit::Success(_))
    }
}

/// The outcome of running an effect to completion: either a success value of
/// type `A` or a [`Cause<E>`] describing why it failed.
///
/// `Exit` is itself a (trivial) effect: [`crate::effect::Effect::from_exit`]
/// lifts one back into the effect algebra, which is how `ensuring`/`onExit`
/// hand finalizers their observation of what happened.
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

impl<A, E: 'static> Exit<A, E> {
    pub(crate) fn from_raw(raw: RawExit) -> Exit<A, E>
    where
        A: 'static,
    {
        match raw {
            RawExit::Success(v) => Exit::Success(*v.downcast::<A>().expect("Exit<A, E> invariant: success value is A")),
            RawExit::Failure(c) => Exit::Failure(Cause::from_raw(c)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    pub fn as_ref(&self) -> Exit<&A, E>
    where
        Cause<E>: Clone,
    {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.clone()),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Discard the success value, keeping only whether it succeeded or why it
    /// failed. Used when joining children whose result the parent doesn't need.
    pub fn as_void(self) -> Exit<(), E> {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }
}

/// Collapse a batch of exits into a single exit void of success value: success
/// only if every exit succeeded, otherwise the causal union of every failure.
/// Used by `for_each`/scope teardown to report whether a parallel batch as a
/// whole succeeded.
pub(crate) fn exit_as_void_all(exits: Vec<RawExit>) -> RawExit {
    let mut cause = RawCause::empty();
    for exit in exits {
        if let RawExit::Failure(c) = exit {
            cause = cause.both(c);
        }
    }
    if cause.is_empty() {
        RawExit::Success(Box::new(()))
    } else {
        RawExit::Failure(cause)
    }
}

impl<A, E> fmt::Debug for Exit<A, E>
where
    A: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Success(a) => f.debug_tuple("Success").field(a).finish(),
            Exit::Failure(c) => f.debug_tuple("Failure").field(c).finish(),
        }
    }
}
