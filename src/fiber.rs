// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber interpreter: a flat loop over a continuation stack.
//!
//! A fiber's entire continuation is a `Vec<Frame>` walked in a loop, never
//! recursed into, so `a.flat_map(...).flat_map(...)` chained a million times
//! deep doesn't blow the host stack. A fiber moves through four lifecycle
//! states — `Running`, `Suspended`, `Exited`, `Consumed` — the last two
//! distinguishing "finished, but nobody's looked yet" from "finished and
//! observed," since a structured-concurrency exit needs both.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::cause::RawCause;
use crate::context::Context;
use crate::exit::RawExit;
use crate::id::FiberId;
use crate::node::{BoxAny, Canceler, Frame, Node, Outcome, Resume};
use crate::scheduler::{Priority, Scheduler};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Running,
    Suspended,
    Exited,
    Consumed,
}

struct Inner {
    id: FiberId,
    context: Context,
    scheduler: Scheduler,
    interruptible: bool,
    stack: Vec<Frame>,
    /// Set when `unsafe_interrupt` is called while `interruptible` is `false`;
    /// consumed (and superseding whatever outcome is in flight) the next time
    /// the fiber becomes interruptible again.
    interrupted_cause: Option<RawCause>,
    current: Option<Node>,
    /// The canceler the currently-pending `Async` registration returned, if
    /// any. Taken and invoked by `unsafe_interrupt` when this fiber is
    /// interrupted while `Suspended`, so the producer can undo whatever
    /// bookkeeping it installed (remove a semaphore waiter, cancel a timer
    /// entry, ...). Cleared whenever the fiber resumes normally, since the
    /// operation it would have canceled already finished on its own.
    canceler: Option<Canceler>,
    lifecycle: Lifecycle,
    /// The fiber's real, unerased terminal exit, kept behind an `Rc` so every
    /// observer — live at publish time or registered afterward via
    /// `on_exit` — reads the *same* value by reference. No `Clone` bound on
    /// the success type is needed because nothing ever actually clones it.
    exit: Option<Rc<RawExit>>,
    observers: RefCell<Vec<Box<dyn FnOnce(&RawExit)>>>,
    parent: Option<Weak<RefCell<Inner>>>,
    children: RefCell<Vec<FiberHandle>>,
}

/// A cloneable, `!Send` handle to a running or completed fiber.
///
/// Because this runtime is single-threaded, plain `Rc<RefCell<_>>` sharing is
/// enough here — no atomic refcounts or type-erased vtables, the machinery a
/// cross-core scheduler would otherwise need.
#[derive(Clone)]
pub struct FiberHandle {
    inner: Rc<RefCell<Inner>>,
}

thread_local! {
    static CURRENT: RefCell<Vec<FiberHandle>> = const { RefCell::new(Vec::new()) };
}

impl FiberHandle {
    /// Creates a new fiber for `node` and immediately schedules it to run.
    pub(crate) fn spawn(node: Node, context: Context, scheduler: Scheduler, parent: Option<&FiberHandle>) -> FiberHandle {
        let handle = FiberHandle {
            inner: Rc::new(RefCell::new(Inner {
                id: FiberId::next(),
                context,
                scheduler: scheduler.clone(),
                interruptible: true,
                stack: Vec::new(),
                interrupted_cause: None,
                current: Some(node),
                canceler: None,
                lifecycle: Lifecycle::Running,
                exit: None,
                observers: RefCell::new(Vec::new()),
                parent: parent.map(|p| Rc::downgrade(&p.inner)),
                children: RefCell::new(Vec::new()),
            })),
        };

        if let Some(parent) = parent {
            parent.inner.borrow().children.borrow_mut().push(handle.clone());
        }

        tracing::trace!(fiber.id = handle.id().as_u64(), "fiber spawned");

        let resume_handle = handle.clone();
        scheduler.schedule_task(Priority::Normal, move || resume_handle.run_until_suspended());
        handle
    }

    pub fn id(&self) -> FiberId {
        self.inner.borrow().id
    }

    pub fn context(&self) -> Context {
        self.inner.borrow().context.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.inner.borrow().scheduler.clone()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.inner.borrow().lifecycle, Lifecycle::Exited | Lifecycle::Consumed)
    }

    /// Registers `callback` to run with this fiber's [`RawExit`] once it
    /// publishes. If the fiber has already finished, `callback` runs
    /// immediately.
    pub(crate) fn on_exit(&self, callback: impl FnOnce(&RawExit) + 'static) {
        let already = self.inner.borrow().exit.clone();
        match already {
            Some(exit) => callback(&exit),
            None => self.inner.borrow().observers.borrow_mut().push(Box::new(callback)),
        }
    }

    /// Requests interruption of this fiber with the given originating fiber
    /// id (`None` means "the runtime itself", e.g. a `run_*` host shutting
    /// down). If the fiber is currently interruptible, the interrupt cause
    /// takes effect immediately (the next time this fiber resumes, as there is
    /// no host-level preemption); otherwise it is stashed until the fiber
    /// re-enters an interruptible region.
    pub fn unsafe_interrupt(&self, from: Option<FiberId>) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.lifecycle, Lifecycle::Exited | Lifecycle::Consumed) {
            return;
        }

        tracing::trace!(fiber.id = self.id().as_u64(), from = ?from.map(|id| id.as_u64()), "interrupt delivered");
        let cause = RawCause::interrupt(from);
        inner.interrupted_cause = Some(match inner.interrupted_cause.take() {
            Some(existing) => existing.then(cause),
            None => cause,
        });

        if inner.interruptible {
            let stored = inner.interrupted_cause.take().unwrap();
            inner.current = Some(Node::FailCause(stored));
            if inner.lifecycle == Lifecycle::Suspended {
                let canceler = inner.canceler.take();
                inner.lifecycle = Lifecycle::Running;
                drop(inner);
                if let Some(canceler) = canceler {
                    canceler.cancel();
                }
                let scheduler = self.scheduler();
                let handle = self.clone();
                scheduler.schedule_task(Priority::Normal, move || handle.run_until_suspended());
            }
        }
    }

    /// Interrupts every structured child of this fiber. Called by `Scope`
    /// teardown and by the fiber's own exit path.
    pub(crate) fn interrupt_children(&self) {
        let id = self.id();
        let children = self.inner.borrow().children.borrow().clone();
        for child in children {
            child.unsafe_interrupt(Some(id));
        }
    }

    fn remove_from_parent(&self) {
        let parent = self.inner.borrow().parent.clone();
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            let my_id = self.id();
            parent.borrow().children.borrow_mut().retain(|c| c.id() != my_id);
        }
    }

    /// Drives the interpreter loop until the fiber either suspends
    /// (awaiting an `Async` resume), needs to yield back to the scheduler, or
    /// exits.
    fn run_until_suspended(&self) {
        CURRENT.with(|c| c.borrow_mut().push(self.clone()));
        let result = self.step_loop();
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });

        if let Some(exit) = result {
            self.publish(exit);
        }
    }

    fn step_loop(&self) -> Option<RawExit> {
        let scheduler = self.scheduler();

        loop {
            let mut node = {
                let mut inner = self.inner.borrow_mut();
                match inner.current.take() {
                    Some(node) => node,
                    None => {
                        inner.lifecycle = Lifecycle::Suspended;
                        return None;
                    }
                }
            };

            // Insert a yield point ahead of the next primitive once the
            // per-step budget is exhausted, so a long-running fiber can't
            // starve everything else queued behind it.
            if scheduler.should_yield() && !matches!(node, Node::Yield) {
                node = Node::OnSuccess(Box::new(Node::Yield), Box::new(move |_| node));
            }

            match self.dispatch(node) {
                DispatchResult::Continue(next) => {
                    self.inner.borrow_mut().current = Some(next);
                }
                DispatchResult::Suspend => {
                    self.inner.borrow_mut().lifecycle = Lifecycle::Suspended;
                    return None;
                }
                DispatchResult::Done(exit) => {
                    return Some(exit);
                }
            }
        }
    }

    fn dispatch(&self, node: Node) -> DispatchResult {
        match node {
            Node::Succeed(v) => self.advance(Outcome::Success(v)),
            Node::FailCause(c) => self.advance(Outcome::Failure(c)),
            Node::Sync(f) => match Node::run_catching(f) {
                Ok(v) => self.advance(Outcome::Success(v)),
                Err(cause) => self.advance(Outcome::Failure(cause)),
            },
            Node::Suspend(f) => match Node::run_catching(f) {
                Ok(next) => DispatchResult::Continue(next),
                Err(cause) => self.advance(Outcome::Failure(cause)),
            },
            Node::WithFiber(f) => {
                let next = f(&mut FiberCx(self));
                DispatchResult::Continue(next)
            }
            Node::Yield => {
                let handle = self.clone();
                self.scheduler()
                    .schedule_task(Priority::Yield, move || handle.resume_suspended(Outcome::Success(Box::new(()))));
                DispatchResult::Suspend
            }
            Node::SetInterruptible(b, inner) => {
                let prev = self.inner.borrow().interruptible;
                self.inner.borrow_mut().interruptible = b;
                self.inner.borrow_mut().stack.push(Frame::SetInterruptible(prev));
                DispatchResult::Continue(*inner)
            }
            Node::AsyncFinalizer(on_cancel, inner) => {
                let prev = self.inner.borrow().interruptible;
                self.inner.borrow_mut().interruptible = false;
                self.inner.borrow_mut().stack.push(Frame::AsyncFinalizer(on_cancel));
                self.inner.borrow_mut().stack.push(Frame::SetInterruptible(prev));
                DispatchResult::Continue(*inner)
            }
            Node::WithContext(new_ctx, inner) => {
                let prev = self.inner.borrow().context.clone();
                self.inner.borrow_mut().context = new_ctx;
                self.inner.borrow_mut().stack.push(Frame::RestoreContext(prev));
                DispatchResult::Continue(*inner)
            }
            Node::OnSuccess(inner, k) => {
                self.inner.borrow_mut().stack.push(Frame::OnSuccess(k));
                DispatchResult::Continue(*inner)
            }
            Node::OnFailure(inner, k) => {
                self.inner.borrow_mut().stack.push(Frame::OnFailure(k));
                DispatchResult::Continue(*inner)
            }
            Node::OnSuccessAndFailure(inner, ks, kf) => {
                self.inner.borrow_mut().stack.push(Frame::OnSuccessAndFailure(ks, kf));
                DispatchResult::Continue(*inner)
            }
            Node::While { mut cond, mut body } => {
                if cond() {
                    let next = body();
                    let cont = Box::new(move |_: BoxAny| Node::While { cond, body });
                    self.inner.borrow_mut().stack.push(Frame::OnSuccess(cont));
                    DispatchResult::Continue(next)
                } else {
                    DispatchResult::Continue(Node::Succeed(Box::new(())))
                }
            }
            Node::Async(register) => self.dispatch_async(register),
            Node::Iterator(mut iter, mut acc) => match iter.next() {
                Some(next_node) => {
                    let cont = Box::new(move |v: BoxAny| {
                        acc.push(v);
                        Node::Iterator(iter, acc)
                    });
                    self.inner.borrow_mut().stack.push(Frame::OnSuccess(cont));
                    DispatchResult::Continue(next_node)
                }
                None => DispatchResult::Continue(Node::Succeed(Box::new(acc))),
            },
        }
    }

    fn dispatch_async(&self, register: Box<dyn FnOnce(&mut Fiber, Resume) -> Option<crate::node::Canceler>>) -> DispatchResult {
        enum AsyncState {
            Pending,
            ResumedInline(Outcome),
            Yielded,
            Done,
        }

        let state = Rc::new(RefCell::new(AsyncState::Pending));
        let state_for_resume = state.clone();
        let handle = self.clone();

        let resume = Resume::new(Box::new(move |outcome: Outcome| {
            let mut s = state_for_resume.borrow_mut();
            match *s {
                AsyncState::Pending => *s = AsyncState::ResumedInline(outcome),
                AsyncState::Yielded => {
                    *s = AsyncState::Done;
                    drop(s);
                    handle.resume_suspended(outcome);
                }
                AsyncState::Done | AsyncState::ResumedInline(_) => {
                    tracing::trace!(fiber.id = handle.id().as_u64(), "duplicate async resume ignored");
                }
            }
        }));

        let mut fiber_cx = Fiber(self);
        let canceler = register(&mut fiber_cx, resume);

        let mut s = state.borrow_mut();
        let prev = std::mem::replace(&mut *s, AsyncState::Yielded);
        match prev {
            AsyncState::Pending => {
                self.inner.borrow_mut().canceler = canceler;
                DispatchResult::Suspend
            }
            AsyncState::ResumedInline(outcome) => {
                *s = AsyncState::Done;
                self.advance(outcome)
            }
            AsyncState::Yielded | AsyncState::Done => unreachable!("async state observed before registration ran"),
        }
    }

    fn resume_suspended(&self, outcome: Outcome) {
        let was_suspended = {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(outcome.into_node());
            inner.canceler = None;
            let was = inner.lifecycle == Lifecycle::Suspended;
            if was {
                inner.lifecycle = Lifecycle::Running;
            }
            was
        };
        if was_suspended {
            let handle = self.clone();
            self.scheduler().schedule_task(Priority::Normal, move || handle.run_until_suspended());
        }
    }

    /// Walks the continuation stack, applying bracketing frames (`SetInterruptible`,
    /// `AsyncFinalizer`) and handing the outcome to the first matching handler
    /// frame. Returns the next `Node` to interpret, or the fiber's final exit
    /// once the stack empties.
    fn advance(&self, mut outcome: Outcome) -> DispatchResult {
        loop {
            let frame = self.inner.borrow_mut().stack.pop();
            let Some(frame) = frame else {
                let raw_exit = match outcome {
                    Outcome::Success(v) => RawExit::Success(v),
                    Outcome::Failure(c) => RawExit::Failure(c),
                };
                return DispatchResult::Done(raw_exit);
            };

            match frame {
                Frame::SetInterruptible(b) => {
                    self.inner.borrow_mut().interruptible = b;
                    if b {
                        let stashed = self.inner.borrow_mut().interrupted_cause.take();
                        if let Some(cause) = stashed {
                            outcome = Outcome::Failure(cause);
                        }
                    }
                }
                Frame::AsyncFinalizer(on_cancel) => {
                    let is_interrupting = matches!(&outcome, Outcome::Failure(c) if c.has_interrupt());
                    if is_interrupting {
                        let saved = outcome;
                        let restore: Box<dyn FnOnce(BoxAny) -> Node> = Box::new({
                            let saved_node = saved_to_node(&saved);
                            move |_| saved_node
                        });
                        let restore_failure: Box<dyn FnOnce(RawCause) -> Node> = Box::new({
                            let saved_node = saved_to_node(&saved);
                            move |_| saved_node
                        });
                        self.inner.borrow_mut().stack.push(Frame::OnSuccessAndFailure(restore, restore_failure));
                        return DispatchResult::Continue(on_cancel());
                    }
                }
                Frame::RestoreContext(ctx) => {
                    self.inner.borrow_mut().context = ctx;
                }
                Frame::OnSuccess(k) => match outcome {
                    Outcome::Success(v) => return DispatchResult::Continue(k(v)),
                    Outcome::Failure(c) => outcome = Outcome::Failure(c),
                },
                Frame::OnFailure(k) => match outcome {
                    Outcome::Failure(c) => return DispatchResult::Continue(k(c)),
                    Outcome::Success(v) => outcome = Outcome::Success(v),
                },
                Frame::OnSuccessAndFailure(ks, kf) => match outcome {
                    Outcome::Success(v) => return DispatchResult::Continue(ks(v)),
                    Outcome::Failure(c) => return DispatchResult::Continue(kf(c)),
                },
            }
        }
    }

    fn publish(&self, exit: RawExit) {
        tracing::trace!(fiber.id = self.id().as_u64(), success = exit.is_success(), "fiber exited");
        self.interrupt_children();
        self.remove_from_parent();

        let exit = Rc::new(exit);
        let observers = {
            let mut inner = self.inner.borrow_mut();
            inner.lifecycle = Lifecycle::Exited;
            inner.exit = Some(exit.clone());
            std::mem::take(&mut *inner.observers.borrow_mut())
        };
        for observer in observers {
            observer(&exit);
        }
        self.inner.borrow_mut().lifecycle = Lifecycle::Consumed;
    }

    /// Returns the fiber's real exit if it has published one, for callers
    /// that need to take ownership of the success value (see
    /// `crate::fiber_ref::FiberRef::await_exit`).
    pub(crate) fn exit(&self) -> Option<Rc<RawExit>> {
        self.inner.borrow().exit.clone()
    }

    pub(crate) fn push_frame(&self, frame: Frame) {
        self.inner.borrow_mut().stack.push(frame);
    }
}

fn saved_to_node(outcome: &Outcome) -> Node {
    match outcome {
        Outcome::Success(_) => unreachable!("AsyncFinalizer restore only triggers on an interrupting failure"),
        Outcome::Failure(c) => Node::FailCause(c.clone()),
    }
}

enum DispatchResult {
    Continue(Node),
    Suspend,
    Done(RawExit),
}

/// The view of the running fiber exposed to `WithFiber`/`Async` registration
/// closures: enough to read identity/context and install async-resume
/// bookkeeping, without exposing the interpreter's internals.
pub struct FiberCx<'a>(&'a FiberHandle);
/// Alias kept for readability at `Async`/`WithFiber` call sites in `effect.rs`.
pub type Fiber<'a> = FiberCx<'a>;

impl<'a> FiberCx<'a> {
    pub fn id(&self) -> FiberId {
        self.0.id()
    }

    pub fn context(&self) -> Context {
        self.0.context()
    }

    pub fn handle(&self) -> FiberHandle {
        self.0.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.0.scheduler()
    }
}

/// Returns the fiber currently executing on this thread, if any (there is
/// always exactly one while inside the interpreter loop; `None` only outside
/// of it, e.g. before `run_*` has started anything).
pub(crate) fn current() -> Option<FiberHandle> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn succeed_runs_to_completion_synchronously() {
        let scheduler = Scheduler::new();
        let handle = FiberHandle::spawn(Node::Succeed(Box::new(42i32)), Context::empty(), scheduler.clone(), None);
        scheduler.drain();
        assert!(handle.is_done());
    }

    #[test]
    fn fail_cause_propagates_to_exit() {
        let scheduler = Scheduler::new();
        let node = Node::FailCause(RawCause::fail(Box::new("boom".to_string())));
        let handle = FiberHandle::spawn(node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();
        assert!(handle.is_done());
    }

    #[test]
    fn on_success_chains_through_stack() {
        let scheduler = Scheduler::new();
        let node = Node::OnSuccess(
            Box::new(Node::Succeed(Box::new(1i32))),
            Box::new(|v| {
                let n = *v.downcast::<i32>().unwrap();
                Node::Succeed(Box::new(n + 1))
            }),
        );
        let observed = Rc::new(RefCell::new(None));
        let handle = FiberHandle::spawn(node, Context::empty(), scheduler.clone(), None);
        let observed_for_cb = observed.clone();
        handle.on_exit(move |exit| {
            if let RawExit::Success(v) = exit {
                *observed_for_cb.borrow_mut() = v.downcast_ref::<i32>().copied();
            }
        });
        scheduler.drain();
        assert_eq!(*observed.borrow(), Some(2));
    }
}
