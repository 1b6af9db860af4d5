// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Runtime`]: the execution surface that turns an [`Effect`] value into a
//! running fiber.
//!
//! Bundles the three ambient services every root fiber needs — a
//! [`Scheduler`], a [`Timer`], and the [`Clock`] driving it — before forking
//! anything onto them. A `Runtime` is cheap to clone (every field it owns
//! already is) and every fiber forked from it keeps its own `Rc` clones of
//! that state, so the `Runtime` value itself can be dropped the moment a
//! fork it started is being driven by something else (another `Runtime`
//! handle, or the caller's own loop around [`Runtime::tick`]).

use std::fmt;
use std::thread;

use crate::cause::Cause;
use crate::context::Context;
use crate::effect::Effect;
use crate::exit::{Exit, RawExit};
use crate::fiber::FiberHandle;
use crate::fiber_ref::FiberRef;
use crate::scheduler::Scheduler;
use crate::time::{Clock, ClockService, Timer, TimerService};

/// The execution surface: a scheduler plus the timer/clock every fiber it
/// hosts can reach through `Context`.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Scheduler,
    timer: Timer,
    clock: Clock,
}

impl Runtime {
    pub fn new() -> Self {
        let clock = Clock::system();
        let timer = Timer::new(clock.clone());
        Self { scheduler: Scheduler::new(), timer, clock }
    }

    /// Builds a `Runtime` around an already-constructed [`Clock`], for tests
    /// that want to drive a virtual timeline instead of real wall-clock time.
    pub fn with_clock(clock: Clock) -> Self {
        let timer = Timer::new(clock.clone());
        Self { scheduler: Scheduler::new(), timer, clock }
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn timer(&self) -> Timer {
        self.timer.clone()
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    fn root_context(&self) -> Context {
        Context::empty()
            .with_reference::<ClockService>(self.clock.clone())
            .with::<TimerService>(self.timer.clone())
    }

    /// Forks `effect` as a root fiber on this runtime's scheduler and returns
    /// a handle to it immediately, without driving any work. Something must
    /// still call [`Runtime::tick`] (or drive the scheduler this runtime
    /// shares) for the fork to make progress — this is the structured-
    /// concurrency equivalent of handing a task to an already-running event
    /// loop rather than blocking on it.
    pub fn run_fork<A: 'static, E: 'static>(&self, effect: Effect<A, E>) -> FiberRef<A, E> {
        let handle = FiberHandle::spawn(effect.node, self.root_context(), self.scheduler.clone(), None);
        FiberRef::new(handle)
    }

    /// Runs queued tasks until either the queue empties or `budget` tasks
    /// have run. For hosts that pump this runtime from their own event loop
    /// instead of blocking inside [`Runtime::run_promise_exit`].
    pub fn tick(&self, budget: usize) -> usize {
        self.scheduler.tick(budget)
    }

    /// Attempts to run `effect` to completion without ever advancing real
    /// time: forks it, drains every task it (transitively) schedules, then
    /// reports whatever the fiber published. An effect that is still
    /// suspended once the queue is empty — e.g. one that called
    /// [`crate::time::sleep`] and is waiting on a timer nobody fired — dies
    /// with a defect rather than hanging, since nothing here will ever flush
    /// time forward.
    pub fn run_sync_exit<A: Clone + 'static, E: 'static>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let handle = FiberHandle::spawn(effect.node, self.root_context(), self.scheduler.clone(), None);
        self.scheduler.drain();
        match handle.exit() {
            Some(raw) => Exit::from_raw(clone_raw_exit::<A>(&raw)),
            None => Exit::Failure(Cause::die("effect did not complete synchronously".to_string())),
        }
    }

    /// Unwraps [`Runtime::run_sync_exit`], panicking with the formatted cause
    /// on failure.
    pub fn run_sync<A: Clone + 'static, E: fmt::Debug + 'static>(&self, effect: Effect<A, E>) -> A {
        match self.run_sync_exit(effect) {
            Exit::Success(a) => a,
            Exit::Failure(cause) => panic!("{cause}"),
        }
    }

    /// Runs `effect` to completion, blocking the calling thread and
    /// advancing real wall-clock time as needed to fire pending timers
    /// ([`crate::time::sleep`], [`crate::concurrency::timeout`], ...). Dies
    /// with a defect if the fiber stalls with neither scheduled work nor a
    /// pending timer to wait on — a sign it's suspended on something outside
    /// this runtime (an external channel, a `Semaphore`/`Latch` nobody will
    /// ever release).
    pub fn run_promise_exit<A: Clone + 'static, E: 'static>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let handle = FiberHandle::spawn(effect.node, self.root_context(), self.scheduler.clone(), None);
        loop {
            self.scheduler.drain();
            if handle.is_done() {
                let raw = handle.exit().expect("fiber invariant: Exited/Consumed implies an exit was recorded");
                return Exit::from_raw(clone_raw_exit::<A>(&raw));
            }
            match self.timer.next_deadline() {
                Some(deadline) => {
                    let now = self.clock.now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    self.timer.turn();
                }
                None => {
                    return Exit::Failure(Cause::die(
                        "effect stalled with no scheduled work and no pending timer".to_string(),
                    ));
                }
            }
        }
    }

    /// Unwraps [`Runtime::run_promise_exit`] into a `Result`, the blocking
    /// equivalent of a rejecting promise.
    pub fn run_promise<A: Clone + 'static, E: 'static>(&self, effect: Effect<A, E>) -> Result<A, Cause<E>> {
        match self.run_promise_exit(effect) {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_raw_exit<A: Clone + 'static>(raw: &RawExit) -> RawExit {
    match raw {
        RawExit::Success(v) => RawExit::Success(Box::new(v.downcast_ref::<A>().expect("Runtime invariant: success value is A").clone())),
        RawExit::Failure(c) => RawExit::Failure(c.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_sync_returns_the_success_value() {
        let runtime = Runtime::new();
        let result = runtime.run_sync(Effect::<i32, String>::succeed(1).map(|n| n + 2));
        assert_eq!(result, 3);
    }

    #[test]
    fn run_sync_exit_reports_a_typed_failure() {
        let runtime = Runtime::new();
        let exit = runtime.run_sync_exit(Effect::<(), String>::fail("boom".to_string()));
        match exit {
            Exit::Failure(cause) => assert_eq!(cause.failure(), Some(&"boom".to_string())),
            Exit::Success(()) => panic!("expected failure"),
        }
    }

    #[test]
    fn run_sync_exit_dies_when_the_effect_cannot_finish_synchronously() {
        let runtime = Runtime::new();
        let exit: Exit<(), ()> = runtime.run_sync_exit(crate::time::sleep(std::time::Duration::from_secs(60)));
        match exit {
            Exit::Failure(cause) => assert!(cause.is_die_only()),
            Exit::Success(()) => panic!("a pending sleep must not complete synchronously"),
        }
    }

    #[test]
    #[should_panic]
    fn run_sync_panics_on_failure() {
        let runtime = Runtime::new();
        runtime.run_sync(Effect::<(), String>::fail("boom".to_string()));
    }

    #[test]
    fn run_promise_exit_advances_real_time_to_resolve_a_sleep() {
        let runtime = Runtime::new();
        let effect: Effect<i32, ()> = crate::time::sleep(std::time::Duration::from_millis(5)).map(|()| 1);
        assert!(matches!(runtime.run_promise_exit(effect), Exit::Success(1)));
    }

    #[test]
    fn run_fork_does_not_progress_until_something_drives_the_scheduler() {
        let runtime = Runtime::new();
        let child: FiberRef<i32, ()> = runtime.run_fork(Effect::succeed(1));
        assert!(!child.is_done());
        runtime.tick(16);
        assert!(child.is_done());
    }
}
