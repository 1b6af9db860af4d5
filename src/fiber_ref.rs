// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`FiberRef`]: a typed handle to a forked child fiber.
//!
//! The cloneable handle a caller holds onto after forking. No reference-
//! counted type-erased vtable is needed here — a plain `Rc<RefCell<_>>`-backed
//! [`crate::fiber::FiberHandle`] plus a `PhantomData` for the success/error
//! types it was spawned with is sufficient for a single-threaded runtime.

use std::marker::PhantomData;

use crate::effect::Effect;
use crate::exit::{Exit, RawExit};
use crate::fiber::FiberHandle;
use crate::id::FiberId;

/// A reference to a (possibly still running) forked fiber, typed with the
/// success/error types of the effect it was forked from.
pub struct FiberRef<A, E> {
    handle: FiberHandle,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for FiberRef<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: 'static, E: 'static> FiberRef<A, E> {
    pub(crate) fn new(handle: FiberHandle) -> Self {
        Self { handle, _marker: PhantomData }
    }

    pub fn id(&self) -> FiberId {
        self.handle.id()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub(crate) fn handle(&self) -> FiberHandle {
        self.handle.clone()
    }

    /// Suspends until the referenced fiber publishes an exit, then resolves
    /// (successfully) with that [`Exit`]. Never fails itself — the
    /// `E2` error channel is whatever the caller's effect already uses.
    ///
    /// Requires `A: Clone` because the fiber's real exit is observed by
    /// reference so every (possibly late, possibly repeated) caller of
    /// `await_exit`/`join` can read it without racing to take ownership;
    /// recovering an owned `A` out of a shared reference needs a clone.
    pub fn await_exit<E2: 'static>(&self) -> Effect<Exit<A, E>, E2>
    where
        A: Clone,
    {
        let handle = self.handle.clone();
        Effect::async_effect(move |_fiber, resume| {
            handle.on_exit(move |raw: &RawExit| {
                let owned = match raw {
                    RawExit::Success(v) => {
                        let value = v.downcast_ref::<A>().expect("FiberRef<A, E> invariant: success value is A").clone();
                        RawExit::Success(Box::new(value))
                    }
                    RawExit::Failure(c) => RawExit::Failure(c.clone()),
                };
                resume.succeed(Box::new(Exit::<A, E>::from_raw(owned)));
            });
            None
        })
    }

    /// Awaits the fiber and re-raises its outcome into the caller's own
    /// error channel: success flows through, failure (including
    /// interruption) is re-raised as this effect's own failure.
    pub fn join(&self) -> Effect<A, E>
    where
        A: Clone,
    {
        self.await_exit::<E>().flat_map(Effect::from_exit)
    }

    /// Requests that the referenced fiber interrupt, using the calling
    /// fiber's id as the interruption's origin, then waits for it to
    /// actually finish before discarding its result.
    pub fn interrupt<E2: 'static>(&self) -> Effect<(), E2>
    where
        A: Clone,
    {
        let target = self.handle.clone();
        let awaiting = self.await_exit::<E2>();
        Effect::with_fiber(move |fiber| {
            target.unsafe_interrupt(Some(fiber.id()));
            Effect::succeed(())
        })
        .flat_map(move |()| awaiting.map(|_exit| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run<A: Clone + 'static, E: 'static>(effect: Effect<A, E>) -> Exit<A, E> {
        let scheduler = Scheduler::new();
        let slot = Rc::new(RefCell::new(None));
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        let slot_clone = slot.clone();
        handle.on_exit(move |exit: &RawExit| {
            *slot_clone.borrow_mut() = Some(match exit {
                RawExit::Success(v) => RawExit::Success(Box::new(v.downcast_ref::<A>().unwrap().clone())),
                RawExit::Failure(c) => RawExit::Failure(c.clone()),
            });
        });
        scheduler.drain();
        Exit::from_raw(slot.borrow_mut().take().expect("fiber did not publish an exit"))
    }

    #[test]
    fn join_returns_the_forked_fibers_success() {
        let effect = Effect::<i32, String>::succeed(1).fork::<String>().flat_map(|child| child.join());
        assert!(matches!(run(effect), Exit::Success(1)));
    }

    #[test]
    fn join_re_raises_the_forked_fibers_failure() {
        let effect = Effect::<i32, String>::fail("boom".to_string()).fork::<String>().flat_map(|child| child.join());
        match run(effect) {
            Exit::Failure(cause) => assert_eq!(cause.failure(), Some(&"boom".to_string())),
            Exit::Success(_) => panic!("expected failure"),
        }
    }
}
