// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Promise`]: a write-once value cell any number of fibers can await.
//!
//! Shaped after [`crate::fiber::FiberHandle`]'s own exit-publishing half —
//! an `Option<Rc<RawExit>>` plus a list of one-shot observers — rather than
//! `Latch`'s repeatable open/close gate, since a promise (like a fiber's
//! exit) resolves at most once and every waiter, current or future, needs to
//! read the same outcome.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::cause::{Cause, RawCause};
use crate::effect::Effect;
use crate::exit::{Exit, RawExit};

struct Inner {
    exit: Option<Rc<RawExit>>,
    observers: Vec<Box<dyn FnOnce(&RawExit)>>,
}

/// A one-shot value cell: resolves at most once, with either a success value
/// or a typed failure, and every awaiter observes the same outcome.
pub struct Promise<A, E> {
    inner: Rc<RefCell<Inner>>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Promise<A, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), _marker: PhantomData }
    }
}

impl<A: Clone + 'static, E: 'static> Promise<A, E> {
    pub fn new() -> Self {
        Self { inner: Rc::new(RefCell::new(Inner { exit: None, observers: Vec::new() })), _marker: PhantomData }
    }

    pub fn is_done(&self) -> bool {
        self.inner.borrow().exit.is_some()
    }

    /// Resolves with `value`. Returns `false` without effect if already
    /// resolved.
    pub fn succeed(&self, value: A) -> bool {
        self.resolve(RawExit::Success(Box::new(value)))
    }

    /// Resolves with a typed failure. Returns `false` without effect if
    /// already resolved.
    pub fn fail(&self, error: E) -> bool {
        self.resolve(RawExit::Failure(RawCause::fail(Box::new(error))))
    }

    /// Resolves with a fully-formed [`Cause<E>`]. Returns `false` without
    /// effect if already resolved.
    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.resolve(RawExit::Failure(cause.raw))
    }

    fn resolve(&self, exit: RawExit) -> bool {
        let observers = {
            let mut inner = self.inner.borrow_mut();
            if inner.exit.is_some() {
                return false;
            }
            inner.exit = Some(Rc::new(exit));
            std::mem::take(&mut inner.observers)
        };
        let exit = self.inner.borrow().exit.clone().expect("just resolved above");
        for observer in observers {
            observer(&exit);
        }
        true
    }

    fn on_resolve(&self, callback: impl FnOnce(&RawExit) + 'static) {
        let already = self.inner.borrow().exit.clone();
        match already {
            Some(exit) => callback(&exit),
            None => self.inner.borrow_mut().observers.push(Box::new(callback)),
        }
    }

    /// Suspends until this promise resolves, then resolves (successfully)
    /// with its stored [`Exit`]. Never fails itself — the `E2` error channel
    /// is whatever the caller's effect already uses.
    pub fn await_exit<E2: 'static>(&self) -> Effect<Exit<A, E>, E2> {
        let this = self.clone();
        Effect::async_effect(move |_fiber, resume| {
            this.on_resolve(move |raw: &RawExit| {
                let owned = match raw {
                    RawExit::Success(v) => {
                        let value = v.downcast_ref::<A>().expect("Promise<A, E> invariant: success value is A").clone();
                        RawExit::Success(Box::new(value))
                    }
                    RawExit::Failure(c) => RawExit::Failure(c.clone()),
                };
                resume.succeed(Box::new(Exit::<A, E>::from_raw(owned)));
            });
            None
        })
    }

    /// Awaits the promise and re-raises its outcome as this effect's own.
    pub fn await_value(&self) -> Effect<A, E> {
        self.await_exit::<E>().flat_map(Effect::from_exit)
    }
}

impl<A: Clone + 'static, E: 'static> Default for Promise<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::fiber::FiberHandle;
    use crate::scheduler::Scheduler;

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
    fn await_value_resolves_once_succeed_is_called() {
        let p: Promise<i32, ()> = Promise::new();
        let waiter = p.clone();
        let exit = {
            let scheduler = Scheduler::new();
            let slot = Rc::new(RefCell::new(None));
            let handle = FiberHandle::spawn(waiter.await_value().node, Context::empty(), scheduler.clone(), None);
            let slot_clone = slot.clone();
            handle.on_exit(move |exit: &RawExit| {
                *slot_clone.borrow_mut() = Some(match exit {
                    RawExit::Success(v) => RawExit::Success(Box::new(*v.downcast_ref::<i32>().unwrap())),
                    RawExit::Failure(c) => RawExit::Failure(c.clone()),
                });
            });
            scheduler.drain();
            assert!(slot.borrow().is_none(), "must not resolve before the promise does");

            p.succeed(42);
            scheduler.drain();
            Exit::<i32, ()>::from_raw(slot.borrow_mut().take().expect("promise did not publish a result"))
        };
        assert!(matches!(exit, Exit::Success(42)));
    }

    #[test]
    fn every_waiter_observes_the_same_resolution() {
        let p: Promise<i32, ()> = Promise::new();
        let a = p.await_value();
        let b = p.await_value();
        p.succeed(7);
        assert!(matches!(run(a), Exit::Success(7)));
        assert!(matches!(run(b), Exit::Success(7)));
    }

    #[test]
    fn a_second_resolution_is_a_no_op() {
        let p: Promise<i32, ()> = Promise::new();
        assert!(p.succeed(1));
        assert!(!p.succeed(2));
        assert!(matches!(run(p.await_value()), Exit::Success(1)));
    }

    #[test]
    fn fail_re_raises_as_a_typed_failure() {
        let p: Promise<i32, &str> = Promise::new();
        p.fail("boom");
        match run(p.await_value()) {
            Exit::Failure(cause) => assert_eq!(cause.failure(), Some(&"boom")),
            Exit::Success(_) => panic!("expected failure"),
        }
    }
}
