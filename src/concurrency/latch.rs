// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Latch`]: a one-bit gate with FIFO waiters, flushed in a single batch.
//!
//! Same queue-of-pending-`Resume`s shape as [`crate::concurrency::semaphore`],
//! stripped down to a single open/closed bit: every waiter is released
//! together, once, per `open`/`release` call, never per-waiter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::effect::Effect;
use crate::node::{Canceler, Resume};

struct Inner {
    open: bool,
    waiters: VecDeque<(u64, Resume)>,
    next_waiter_id: u64,
}

/// A gate that is either open (waiting is a no-op) or closed (waiters queue
/// until it opens). Cloning shares the same gate.
#[derive(Clone)]
pub struct Latch {
    inner: Rc<RefCell<Inner>>,
}

impl Latch {
    pub fn new(open: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { open, waiters: VecDeque::new(), next_waiter_id: 0 })),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().open
    }

    /// Suspends until the latch is open. Resolves immediately if it already is.
    pub fn await_open<E: 'static>(&self) -> Effect<(), E> {
        let inner = self.inner.clone();
        Effect::async_effect(move |_fiber, resume| {
            let mut state = inner.borrow_mut();
            if state.open {
                drop(state);
                resume.succeed(Box::new(()));
                return None;
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back((id, resume.into_resume()));
            drop(state);

            let inner = inner.clone();
            Some(Canceler::new(move || {
                inner.borrow_mut().waiters.retain(|(waiter_id, _)| *waiter_id != id);
            }))
        })
    }

    /// Opens the latch (idempotent) and releases every waiter in FIFO order,
    /// in a single batch.
    pub fn open(&self) {
        self.inner.borrow_mut().open = true;
        self.flush();
    }

    /// Releases every current waiter without changing the open/closed state —
    /// distinct from `open` only when the latch is closed: a `release` with
    /// the latch still closed wakes today's waiters but lets any future
    /// `await_open` queue again.
    pub fn release(&self) {
        self.flush();
    }

    /// Closes the latch; future `await_open` calls suspend until the next
    /// `open`.
    pub fn close(&self) {
        self.inner.borrow_mut().open = false;
    }

    fn flush(&self) {
        let waiters = std::mem::take(&mut self.inner.borrow_mut().waiters);
        for (_, resume) in waiters {
            resume.succeed(Box::new(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::exit::RawExit;
    use crate::fiber::FiberHandle;
    use crate::scheduler::Scheduler;
    use std::cell::Cell;

    #[test]
    fn await_open_resolves_immediately_when_already_open() {
        let scheduler = Scheduler::new();
        let latch = Latch::new(true);
        let done = Rc::new(Cell::new(false));
        let done_clone = done.clone();
        let handle = FiberHandle::spawn(latch.await_open::<()>().node, Context::empty(), scheduler.clone(), None);
        handle.on_exit(move |_: &RawExit| done_clone.set(true));
        scheduler.drain();
        assert!(done.get());
    }

    #[test]
    fn waiters_queue_while_closed_and_release_together_on_open() {
        let scheduler = Scheduler::new();
        let latch = Latch::new(false);
        let log = Rc::new(RefCell::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let log = log.clone();
            let handle = FiberHandle::spawn(latch.await_open::<()>().node, Context::empty(), scheduler.clone(), None);
            handle.on_exit(move |_: &RawExit| log.borrow_mut().push(label));
        }
        scheduler.drain();
        assert!(log.borrow().is_empty());

        latch.open();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(latch.is_open());
    }

    #[test]
    fn closing_an_open_latch_makes_new_waiters_queue_again() {
        let scheduler = Scheduler::new();
        let latch = Latch::new(true);
        latch.close();
        assert!(!latch.is_open());

        let done = Rc::new(Cell::new(false));
        let done_clone = done.clone();
        let handle = FiberHandle::spawn(latch.await_open::<()>().node, Context::empty(), scheduler.clone(), None);
        handle.on_exit(move |_: &RawExit| done_clone.set(true));
        scheduler.drain();
        assert!(!done.get());
    }
}
