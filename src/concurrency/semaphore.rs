// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Semaphore`]: a counting permit pool with FIFO waiters.
//!
//! Waiters queue in a plain `VecDeque` and are woken first-in-first-out;
//! a release flushes every waiter it can now satisfy in one batch rather
//! than once per permit. A single-threaded `Rc`-backed runtime has no need
//! for an intrusive lock-free waiter list — a `VecDeque` is already as cheap
//! to push/pop/cancel as this scheduler ever needs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::effect::{Effect, Restore};
use crate::node::{Canceler, Resume};

struct Waiter {
    id: u64,
    want: usize,
    resume: Resume,
}

struct Inner {
    permits: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// A counting semaphore. Cloning shares the same pool of permits.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<Inner>>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { permits, waiters: VecDeque::new(), next_waiter_id: 0 })),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.inner.borrow().permits
    }

    /// Suspends until `count` permits are free, then takes them.
    pub fn take<E: 'static>(&self, count: usize) -> Effect<(), E> {
        let inner = self.inner.clone();
        Effect::async_effect(move |_fiber, resume| {
            let mut state = inner.borrow_mut();
            if state.waiters.is_empty() && state.permits >= count {
                state.permits -= count;
                drop(state);
                resume.succeed(Box::new(()));
                return None;
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let raw = resume.into_resume();
            state.waiters.push_back(Waiter { id, want: count, resume: raw });
            drop(state);

            let inner = inner.clone();
            Some(Canceler::new(move || {
                // If `release` already popped and resumed this waiter before
                // cancellation runs, its id is no longer in the queue and
                // this is a no-op.
                inner.borrow_mut().waiters.retain(|w| w.id != id);
            }))
        })
    }

    /// Releases `count` permits, then wakes as many queued waiters as can now
    /// be satisfied, in FIFO order, stopping at the first waiter that still
    /// can't be satisfied (a later, smaller request is not allowed to jump
    /// the queue).
    pub fn release(&self, count: usize) {
        let mut state = self.inner.borrow_mut();
        state.permits += count;
        flush(&mut state);
    }

    /// Runs `body` holding `count` permits, releasing them on every exit path
    /// (success, failure, or interruption). Acquiring and releasing are
    /// uninterruptible — a fiber can't be cancelled mid-acquire and leak a
    /// permit, or mid-release and leave one stuck — but `body` itself runs
    /// interruptibly via [`Restore`], same as outside the mask.
    pub fn with_permits<A: 'static, E: 'static>(&self, count: usize, body: Effect<A, E>) -> Effect<A, E> {
        let acquire_sem = self.clone();
        let release_sem = self.clone();
        Effect::uninterruptible_mask(move |restore: Restore| {
            acquire_sem
                .take(count)
                .flat_map(move |()| restore.apply(body).ensuring(move || Effect::sync(move || release_sem.release(count))))
        })
    }
}

fn flush(state: &mut Inner) {
    let mut woken = 0;
    while let Some(front) = state.waiters.front() {
        if front.want > state.permits {
            break;
        }
        let waiter = state.waiters.pop_front().expect("checked front is Some");
        state.permits -= waiter.want;
        waiter.resume.succeed(Box::new(()));
        woken += 1;
    }
    if woken > 0 {
        tracing::trace!(woken, permits = state.permits, "semaphore wake batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::exit::RawExit;
    use crate::fiber::FiberHandle;
    use crate::scheduler::Scheduler;

    fn run<E: 'static>(effect: Effect<(), E>, scheduler: &Scheduler) -> Rc<Cell<bool>> {
        let done = Rc::new(Cell::new(false));
        let done_clone = done.clone();
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        handle.on_exit(move |_: &RawExit| done_clone.set(true));
        scheduler.drain();
        done
    }

    #[test]
    fn take_succeeds_immediately_when_enough_permits_are_free() {
        let scheduler = Scheduler::new();
        let sem = Semaphore::new(2);
        let done = run(sem.take::<()>(2), &scheduler);
        assert!(done.get());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn a_waiter_is_woken_once_release_frees_enough_permits() {
        let scheduler = Scheduler::new();
        let sem = Semaphore::new(1);
        let _holder = run(sem.take::<()>(1), &scheduler);

        let waiting = run(sem.take::<()>(1), &scheduler);
        assert!(!waiting.get(), "no permits free yet");

        sem.release(1);
        assert!(waiting.get());
    }

    #[test]
    fn waiters_are_woken_in_fifo_order() {
        let scheduler = Scheduler::new();
        let sem = Semaphore::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let log = log.clone();
            let effect: Effect<(), ()> = sem.take(1);
            let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
            handle.on_exit(move |_: &RawExit| log.borrow_mut().push(label));
        }
        scheduler.drain();
        assert!(log.borrow().is_empty());

        sem.release(3);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn with_permits_runs_the_body_interruptibly_and_still_releases() {
        let scheduler = Scheduler::new();
        let sem = Semaphore::new(1);
        let body: Effect<(), ()> = Effect::async_effect(|_fiber, _resume| None);
        let effect = sem.with_permits(1, body);
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();
        assert_eq!(sem.available_permits(), 0, "permit held while the body is suspended");
        assert!(!handle.is_done());

        handle.unsafe_interrupt(None);
        scheduler.drain();

        assert!(handle.is_done(), "the suspended body must be interruptible, not stuck uninterruptible");
        assert_eq!(sem.available_permits(), 1, "release still runs once the interrupted body unwinds");
    }

    #[test]
    fn with_permits_releases_after_the_body_runs() {
        let scheduler = Scheduler::new();
        let sem = Semaphore::new(1);
        let body: Effect<i32, ()> = Effect::succeed(7);
        let effect = sem.with_permits(1, body);
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        handle.on_exit(move |exit: &RawExit| {
            if let RawExit::Success(v) = exit {
                *result_clone.borrow_mut() = Some(*v.downcast_ref::<i32>().unwrap());
            }
        });
        scheduler.drain();
        assert_eq!(*result.borrow(), Some(7));
        assert_eq!(sem.available_permits(), 1);
    }
}
