// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timers and sleeping.
//!
//! This runtime only ever has one thread driving one scheduler, and in
//! practice a handful of outstanding timers at once, so a hierarchical timer
//! wheel would buy nothing here: [`Timer`] keeps pending deadlines in a
//! [`BTreeMap`] ordered by `(Instant, sequence)`, giving O(log n)
//! insert/cancel/next-deadline, which is the right tradeoff at this scale.
//! A registration fires synchronously if its deadline has already passed,
//! otherwise it parks in the timer and is removed from it on cancellation.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::cause::Cause;
use crate::context::{ReferenceTag, Tag};
use crate::effect::Effect;
use crate::error::NoSuchElementError;
use crate::node::{Canceler, Resume};

pub use crate::clock::Clock;

/// [`ReferenceTag`] binding the ambient [`Clock`]; defaults to
/// [`Clock::system`] when nothing has overridden it (tests can `with_reference`
/// a virtual clock).
pub struct ClockService;

impl ReferenceTag for ClockService {
    type Value = Clock;

    fn default_value() -> Clock {
        Clock::system()
    }
}

/// [`Tag`] binding the runtime's [`Timer`]. Unlike the clock, there is no
/// sensible default: a timer needs to be driven by something, so the `run_*`
/// entry points in `runtime.rs` always bind one before running a fiber tree,
/// and [`sleep`] dies with [`NoSuchElementError`] if it ever finds none
/// (a sign an effect escaped the runtime that was supposed to host it).
pub(crate) struct TimerService;

impl Tag for TimerService {
    type Value = Timer;
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Debug)]
struct EntryKey {
    deadline_nanos: u128,
    seq: u64,
}

/// A single-threaded deadline queue. Cheap to clone (an `Rc` bump); clones
/// share the same pending entries.
#[derive(Clone)]
pub struct Timer {
    clock: Clock,
    entries: Rc<std::cell::RefCell<BTreeMap<EntryKey, Resume>>>,
    epoch: Instant,
    next_seq: Rc<Cell<u64>>,
}

/// A handle returned by [`Timer::register`], used to cancel a pending entry
/// before it fires.
pub(crate) struct TimerKey {
    key: EntryKey,
}

impl Timer {
    pub fn new(clock: Clock) -> Self {
        let epoch = clock.now();
        Self {
            clock,
            entries: Rc::new(std::cell::RefCell::new(BTreeMap::new())),
            epoch,
            next_seq: Rc::new(Cell::new(0)),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// The soonest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.borrow().keys().next().map(|key| self.epoch + Duration::from_nanos(key.deadline_nanos as u64))
    }

    /// Registers `resume` to fire at `deadline`. If `deadline` has already
    /// passed, fires immediately and returns `None` (nothing to cancel).
    pub(crate) fn register(&self, deadline: Instant, resume: Resume) -> Option<TimerKey> {
        let now = self.clock.now();
        if deadline <= now {
            resume.succeed(Box::new(()));
            return None;
        }

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let key = EntryKey {
            deadline_nanos: deadline.saturating_duration_since(self.epoch).as_nanos(),
            seq,
        };
        self.entries.borrow_mut().insert(key, resume);
        Some(TimerKey { key })
    }

    /// Removes a pending entry before it fires. A no-op if it already fired.
    pub(crate) fn cancel(&self, key: TimerKey) {
        self.entries.borrow_mut().remove(&key.key);
    }

    /// Fires every entry whose deadline has passed, returning how many fired.
    pub fn turn(&self) -> usize {
        let now = self.clock.now();
        let now_nanos = now.saturating_duration_since(self.epoch).as_nanos();
        let due: Vec<EntryKey> = self
            .entries
            .borrow()
            .range(..=EntryKey { deadline_nanos: now_nanos, seq: u64::MAX })
            .map(|(k, _)| *k)
            .collect();

        let mut fired = 0;
        for key in due {
            if let Some(resume) = self.entries.borrow_mut().remove(&key) {
                resume.succeed(Box::new(()));
                fired += 1;
            }
        }
        if fired > 0 {
            tracing::trace!(fired, "timer turn");
        }
        fired
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("pending", &self.entries.borrow().len()).finish()
    }
}

/// Suspends the current fiber for at least `duration`.
pub fn sleep<E: 'static>(duration: Duration) -> Effect<(), E> {
    sleep_until(move |clock| clock.deadline_after(duration))
}

/// Suspends the current fiber until `compute_deadline`, given the runtime's
/// clock, returns an instant.
fn sleep_until<E: 'static>(compute_deadline: impl FnOnce(&Clock) -> Instant + 'static) -> Effect<(), E> {
    Effect::async_effect(move |fiber, resume| {
        let Some(timer) = fiber.context().get_service::<TimerService>() else {
            resume.fail_cause(Cause::die(NoSuchElementError { service: "Timer" }));
            return None;
        };
        let deadline = compute_deadline(timer.clock());
        let raw_resume = resume.into_resume();
        match timer.register(deadline, raw_resume) {
            Some(key) => {
                let timer = timer.clone();
                Some(Canceler::new(move || timer.cancel(key)))
            }
            None => None,
        }
    })
}

/// Reads the ambient [`Clock`] (see [`ClockService`]) and applies `f` to it,
/// without suspending.
pub fn clock_with<T: 'static, E: 'static>(f: impl FnOnce(&Clock) -> T + 'static) -> Effect<T, E> {
    Effect::with_fiber(move |fiber| Effect::succeed(f(&fiber.context().get_reference::<ClockService>())))
}

/// Milliseconds since the Unix epoch, backed by the system wall clock. Not
/// affected by [`ClockService`] overrides — this is for logging/observability
/// timestamps, not for scheduling, which always goes through [`Timer`].
pub fn current_time_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Nanoseconds since the Unix epoch. See [`current_time_millis`].
pub fn current_time_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::fiber::FiberHandle;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell as StdRefCell;

    struct FixedClock {
        now: Cell<Instant>,
    }

    impl crate::clock::ClockSource for FixedClock {
        fn now(&self) -> Instant {
            self.now.get()
        }
    }

    #[test]
    fn register_past_deadline_fires_immediately() {
        let clock = Clock::new(Rc::new(FixedClock { now: Cell::new(Instant::now()) }));
        let timer = Timer::new(clock.clone());
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let resume = Resume::new(Box::new(move |_| fired_clone.set(true)));

        let key = timer.register(clock.now() - Duration::from_secs(1), resume);
        assert!(key.is_none());
        assert!(fired.get());
    }

    #[test]
    fn turn_fires_due_entries_in_deadline_order() {
        let now = Instant::now();
        let source = Rc::new(FixedClock { now: Cell::new(now) });
        let clock = Clock::new(source.clone());
        let timer = Timer::new(clock.clone());
        let order = Rc::new(StdRefCell::new(Vec::new()));

        for (label, offset) in [("b", 20), ("a", 10), ("c", 30)] {
            let order = order.clone();
            let resume = Resume::new(Box::new(move |_| order.borrow_mut().push(label)));
            timer.register(now + Duration::from_millis(offset), resume);
        }

        source.now.set(now + Duration::from_millis(40));
        let fired = timer.turn();

        assert_eq!(fired, 3);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn sleep_suspends_and_resumes_via_timer_turn() {
        let now = Instant::now();
        let source = Rc::new(FixedClock { now: Cell::new(now) });
        let clock = Clock::new(source.clone());
        let timer = Timer::new(clock.clone());
        let scheduler = Scheduler::new();
        let context = Context::empty().with::<TimerService>(timer.clone());

        let effect: Effect<(), ()> = sleep(Duration::from_millis(50));
        let done = Rc::new(Cell::new(false));
        let done_clone = done.clone();
        let handle = FiberHandle::spawn(effect.node, context, scheduler.clone(), None);
        handle.on_exit(move |_| done_clone.set(true));
        scheduler.drain();
        assert!(!done.get(), "sleep must not resolve before its deadline");

        source.now.set(now + Duration::from_millis(60));
        timer.turn();
        scheduler.drain();
        assert!(done.get());
    }

    #[test]
    fn clock_with_reads_the_bound_clock() {
        let now = Instant::now();
        let source = Rc::new(FixedClock { now: Cell::new(now) });
        let clock = Clock::new(source);
        let scheduler = Scheduler::new();
        let context = Context::empty().with_reference::<ClockService>(clock);

        let effect: Effect<Instant, ()> = clock_with(|clock| clock.now());
        let result = Rc::new(StdRefCell::new(None));
        let result_clone = result.clone();
        let handle = FiberHandle::spawn(effect.node, context, scheduler.clone(), None);
        handle.on_exit(move |exit: &crate::exit::RawExit| {
            if let crate::exit::RawExit::Success(v) = exit {
                *result_clone.borrow_mut() = Some(*v.downcast_ref::<Instant>().unwrap());
            }
        });
        scheduler.drain();
        assert_eq!(result.borrow().expect("clock_with did not publish a result"), now);
    }
}
