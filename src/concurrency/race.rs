// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Racing multiple effects against each other: fork every branch as a
//! structured child, let exactly one publish, interrupt the rest.
//!
//! [`timeout`] is just a race against a sleeping deadline branch that fails
//! with [`TimeoutError`]. The fan-out in [`race_all`]/[`race_all_first`]
//! needs no intrusive waiter list — a race only ever has as many branches as
//! the caller passed in, and nothing else waits on it concurrently, so a
//! plain per-branch `on_exit` callback is all the "first to finish wakes,
//! the rest are torn down" logic needs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::cause::RawCause;
use crate::context::Context;
use crate::effect::Effect;
use crate::error::TimeoutError;
use crate::exit::RawExit;
use crate::fiber::FiberHandle;
use crate::node::{Canceler, Resume};
use crate::scheduler::Scheduler;
use crate::time;

/// Runs every branch as a structured child of the calling fiber. The first
/// branch to *succeed* publishes its value and interrupts every other branch;
/// if every branch fails, the causal union of all of them is published.
///
/// Requires `A: Clone`: a child's exit is observed by shared reference (see
/// [`crate::fiber::FiberHandle::on_exit`]), so recovering an owned success
/// value out of it needs a clone, same as [`crate::fiber_ref::FiberRef`].
pub fn race_all<A: Clone + 'static, E: 'static>(branches: Vec<Effect<A, E>>) -> Effect<A, E> {
    Effect::async_effect(move |fiber, resume| {
        spawn_race::<A, E>(branches, fiber.scheduler(), fiber.context(), &fiber.handle(), resume.into_resume(), Mode::FirstSuccess)
    })
}

/// Like [`race_all`], but the first branch to publish *any* exit — success or
/// failure — wins; the rest are interrupted.
pub fn race_all_first<A: Clone + 'static, E: 'static>(branches: Vec<Effect<A, E>>) -> Effect<A, E> {
    Effect::async_effect(move |fiber, resume| {
        spawn_race::<A, E>(branches, fiber.scheduler(), fiber.context(), &fiber.handle(), resume.into_resume(), Mode::FirstExit)
    })
}

/// Two-branch form of [`race_all`].
pub fn race<A: Clone + 'static, E: 'static>(a: Effect<A, E>, b: Effect<A, E>) -> Effect<A, E> {
    race_all(vec![a, b])
}

/// Two-branch form of [`race_all_first`].
pub fn race_first<A: Clone + 'static, E: 'static>(a: Effect<A, E>, b: Effect<A, E>) -> Effect<A, E> {
    race_all_first(vec![a, b])
}

/// Fails with [`TimeoutError`] (converted into `E`) if `effect` does not
/// complete within `duration`; otherwise resolves with `effect`'s own outcome.
pub fn timeout<A: Clone + 'static, E: From<TimeoutError> + 'static>(effect: Effect<A, E>, duration: Duration) -> Effect<A, E> {
    let deadline: Effect<A, E> = time::sleep(duration).flat_map(|()| Effect::fail(E::from(TimeoutError(()))));
    race_first(effect, deadline)
}

/// Like [`timeout`], but runs `or_else()` instead of failing when the
/// deadline wins the race.
pub fn timeout_or_else<A: Clone + 'static, E: 'static>(
    effect: Effect<A, E>,
    duration: Duration,
    or_else: impl FnOnce() -> Effect<A, E> + 'static,
) -> Effect<A, E> {
    let deadline: Effect<A, E> = time::sleep(duration).flat_map(move |()| or_else());
    race_first(effect, deadline)
}

#[derive(Clone, Copy)]
enum Mode {
    FirstSuccess,
    FirstExit,
}

fn spawn_race<A: Clone + 'static, E: 'static>(
    branches: Vec<Effect<A, E>>,
    scheduler: Scheduler,
    context: Context,
    parent: &FiberHandle,
    resume: Resume,
    mode: Mode,
) -> Option<Canceler> {
    if branches.is_empty() {
        resume.fail_cause(RawCause::die(Box::new("race requires at least one branch")));
        return None;
    }

    let total = branches.len();
    let parent_id = parent.id();
    let remaining = Rc::new(Cell::new(total));
    let aggregated: Rc<RefCell<RawCause>> = Rc::new(RefCell::new(RawCause::empty()));
    let settled = Rc::new(Cell::new(false));
    let resume = Rc::new(RefCell::new(Some(resume)));
    let children: Rc<RefCell<Vec<FiberHandle>>> = Rc::new(RefCell::new(Vec::with_capacity(total)));

    for branch in branches {
        let handle = FiberHandle::spawn(branch.node, context.clone(), scheduler.clone(), Some(parent));
        children.borrow_mut().push(handle.clone());

        let remaining = remaining.clone();
        let aggregated = aggregated.clone();
        let settled = settled.clone();
        let resume = resume.clone();
        let children = children.clone();

        handle.on_exit(move |exit: &RawExit| {
            remaining.set(remaining.get() - 1);

            let wins = match mode {
                Mode::FirstExit => true,
                Mode::FirstSuccess => exit.is_success(),
            };

            if !settled.get() && wins {
                settled.set(true);
                if let Some(resume) = resume.borrow_mut().take() {
                    publish::<A>(resume, exit);
                }
                for sibling in children.borrow().iter() {
                    sibling.unsafe_interrupt(Some(parent_id));
                }
                return;
            }

            if let RawExit::Failure(cause) = exit {
                let mut agg = aggregated.borrow_mut();
                let taken = std::mem::replace(&mut *agg, RawCause::empty());
                *agg = taken.then(cause.clone());
            }

            if remaining.get() == 0 && !settled.get() {
                settled.set(true);
                if let Some(resume) = resume.borrow_mut().take() {
                    resume.fail_cause(aggregated.borrow().clone());
                }
            }
        });
    }

    None
}

fn publish<A: Clone + 'static>(resume: Resume, exit: &RawExit) {
    match exit {
        RawExit::Success(v) => {
            let value = v.downcast_ref::<A>().expect("race branch invariant: success value is A").clone();
            resume.succeed(Box::new(value));
        }
        RawExit::Failure(cause) => resume.fail_cause(cause.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::Exit;

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
        Exit::from_raw(slot.borrow_mut().take().expect("race did not publish an exit"))
    }

    #[test]
    fn race_all_picks_the_first_success() {
        let exit = run(race(Effect::<&str, ()>::fail(()), Effect::<&str, ()>::succeed("winner")));
        assert!(matches!(exit, Exit::Success("winner")));
    }

    #[test]
    fn race_all_aggregates_causes_when_every_branch_fails() {
        let exit = run(race(Effect::<(), &str>::fail("left"), Effect::<(), &str>::fail("right")));
        match exit {
            Exit::Failure(cause) => assert_eq!(cause.failures().count(), 2),
            Exit::Success(()) => panic!("expected failure"),
        }
    }

    #[test]
    fn race_all_first_returns_whichever_branch_finishes_first_even_if_it_failed() {
        let exit = run(race_first(Effect::<i32, &str>::fail("boom"), Effect::<i32, &str>::succeed(1)));
        match exit {
            Exit::Failure(cause) => assert_eq!(cause.failure(), Some(&"boom")),
            Exit::Success(_) => panic!("expected the failing branch to win: it runs synchronously, first"),
        }
    }

    #[test]
    fn timeout_fails_with_timeout_error_when_the_deadline_wins() {
        use crate::time::{Timer, TimerService};

        #[derive(Debug)]
        struct MyError(TimeoutError);
        impl From<TimeoutError> for MyError {
            fn from(e: TimeoutError) -> Self {
                MyError(e)
            }
        }

        let timer = Timer::new(crate::clock::Clock::system());
        let context = Context::empty().with::<TimerService>(timer);
        let slow: Effect<i32, MyError> = time::sleep(Duration::from_secs(60)).map(|()| 1);
        let effect = timeout(slow, Duration::from_millis(0));

        let scheduler = Scheduler::new();
        let slot = Rc::new(RefCell::new(None));
        let handle = FiberHandle::spawn(effect.node, context, scheduler.clone(), None);
        let slot_clone = slot.clone();
        handle.on_exit(move |exit: &RawExit| {
            *slot_clone.borrow_mut() = Some(match exit {
                RawExit::Success(v) => RawExit::Success(Box::new(*v.downcast_ref::<i32>().unwrap())),
                RawExit::Failure(c) => RawExit::Failure(c.clone()),
            });
        });
        scheduler.drain();
        let exit: Exit<i32, MyError> = Exit::from_raw(slot.borrow_mut().take().expect("timeout did not publish an exit"));
        assert!(exit.is_failure());
    }

    #[test]
    fn timeout_or_else_runs_the_fallback_when_the_deadline_wins() {
        use crate::time::{Timer, TimerService};

        let timer = Timer::new(crate::clock::Clock::system());
        let context = Context::empty().with::<TimerService>(timer);
        let slow: Effect<i32, ()> = time::sleep(Duration::from_secs(60)).map(|()| 1);
        let effect = timeout_or_else(slow, Duration::from_millis(0), || Effect::succeed(99));
        let exit = {
            let scheduler = Scheduler::new();
            let slot = Rc::new(RefCell::new(None));
            let handle = FiberHandle::spawn(effect.node, context, scheduler.clone(), None);
            let slot_clone = slot.clone();
            handle.on_exit(move |exit: &RawExit| {
                *slot_clone.borrow_mut() = Some(match exit {
                    RawExit::Success(v) => RawExit::Success(Box::new(*v.downcast_ref::<i32>().unwrap())),
                    RawExit::Failure(c) => RawExit::Failure(c.clone()),
                });
            });
            scheduler.drain();
            Exit::<i32, ()>::from_raw(slot.borrow_mut().take().expect("timeout_or_else did not publish an exit"))
        };
        assert!(matches!(exit, Exit::Success(99)));
    }
}
