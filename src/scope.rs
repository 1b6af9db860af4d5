// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Scope`]: deterministic, reverse-order finalizer execution.
//!
//! A `Scope` tracks spawned work tied to a lexical region and guarantees it
//! is torn down — gracefully, not dropped — by the time that region ends,
//! whether it ends in success, failure, or interruption; the same shape as
//! an async `Scope<'env, E>`/cancellation-context pair, adapted here to the
//! fiber/effect vocabulary: a `Scope` holds an ordered list of finalizing
//! effect nodes and an open/closed flag. Closing runs every registered
//! finalizer, most recently added first, unconditionally — one finalizer
//! failing does not skip the rest — and folds any failures into a single
//! cause. Closing twice is a no-op.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cause::RawCause;
use crate::context::Tag;
use crate::effect::{self, Effect};
use crate::error::NoSuchElementError;
use crate::node::Node;

/// [`Tag`] binding the innermost open [`Scope`], pushed into a fiber's
/// [`crate::context::Context`] by [`Effect::scoped`]. There is no default —
/// [`acquire_release`] dies with [`NoSuchElementError`] if it's used outside
/// one, the same contract `time::TimerService` has for [`crate::time::sleep`].
pub(crate) struct ScopeService;

impl Tag for ScopeService {
    type Value = Scope;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Open,
    Closed,
}

struct Inner {
    state: State,
    finalizers: Vec<Node>,
}

/// A handle to an open resource scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<RefCell<Inner>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Open,
                finalizers: Vec::new(),
            })),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == State::Open
    }

    /// Registers a finalizer, as an untyped node, to run when this scope
    /// closes. Returns `false` (and does not register) if the scope already
    /// closed — callers should run the finalizer immediately in that case.
    pub(crate) fn add_finalizer_node(&self, finalizer: Node) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::Closed {
            return false;
        }
        inner.finalizers.push(finalizer);
        true
    }

    /// Public, typed convenience over [`Scope::add_finalizer_node`].
    pub fn add_finalizer<E: 'static>(&self, finalizer: Effect<(), E>) -> bool {
        self.add_finalizer_node(finalizer.node)
    }

    /// Closes the scope: runs every registered finalizer in reverse
    /// registration order unconditionally, folding any failures into one
    /// cause via [`RawCause::then`]. Closing an already-closed scope yields
    /// `Effect::succeed(())` again.
    pub fn close<E: 'static>(&self) -> Effect<(), E> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::Closed {
            return Effect::succeed(());
        }
        inner.state = State::Closed;
        let finalizers = std::mem::take(&mut inner.finalizers);
        drop(inner);

        tracing::trace!(finalizers = finalizers.len(), "scope closing");
        effect::wrap(chain(finalizers))
    }

    /// Opens a child scope nested inside this one: a finalizer on the parent
    /// closes the child, so closing the parent tears the child down too
    /// (closing is idempotent, so it's harmless if the child already closed
    /// itself first). If this scope is already closed, the child is born
    /// closed as well.
    pub fn fork<E: 'static>(&self) -> Scope {
        let child = Scope::new();
        if !self.is_open() {
            child.inner.borrow_mut().state = State::Closed;
            return child;
        }
        let child_for_finalizer = child.clone();
        self.add_finalizer_node(Node::Suspend(Box::new(move || child_for_finalizer.close::<E>().node)));
        child
    }
}

/// Acquires a resource and guarantees its release: runs `acquire`
/// uninterruptibly, then registers `release` as a finalizer on the nearest
/// enclosing [`Scope`] (see [`ScopeService`]) before handing the acquired
/// value back to the caller.
///
/// Requires `A: Clone` because the finalizer and the return value both need
/// their own owned copy of what `acquire` produced.
pub fn acquire_release<A: Clone + 'static, E: 'static>(
    acquire: Effect<A, E>,
    release: impl FnOnce(A) -> Effect<(), E> + 'static,
) -> Effect<A, E> {
    Effect::with_fiber(move |fiber| {
        let Some(scope) = fiber.context().get_service::<ScopeService>() else {
            return Effect::die(NoSuchElementError { service: "Scope" });
        };
        acquire.flat_map(move |value| {
            let for_release = value.clone();
            scope.add_finalizer_node(Node::Suspend(Box::new(move || release(for_release).node)));
            Effect::succeed(value)
        })
    })
    .uninterruptible()
}

/// Builds a node that runs each finalizer, last-registered first, always
/// proceeding to the next one regardless of the previous outcome, and fails
/// at the end with the combined cause if any finalizer failed.
fn chain(finalizers: Vec<Node>) -> Node {
    let accumulated: Rc<RefCell<Option<RawCause>>> = Rc::new(RefCell::new(None));

    let mut node = {
        let accumulated = accumulated.clone();
        Node::Suspend(Box::new(move || match accumulated.borrow_mut().take() {
            Some(cause) => Node::FailCause(cause),
            None => Node::Succeed(Box::new(())),
        }))
    };

    for finalizer in finalizers.into_iter().rev() {
        let next = Rc::new(RefCell::new(Some(node)));
        let next_on_success = next.clone();
        let next_on_failure = next.clone();
        let accumulated_on_failure = accumulated.clone();

        node = Node::OnSuccessAndFailure(
            Box::new(finalizer),
            Box::new(move |_| {
                next_on_success
                    .borrow_mut()
                    .take()
                    .expect("scope finalizer continuation consumed once")
            }),
            Box::new(move |cause| {
                let mut guard = accumulated_on_failure.borrow_mut();
                let merged = match guard.take() {
                    Some(existing) => existing.then(cause),
                    None => cause,
                };
                *guard = Some(merged);
                drop(guard);
                next_on_failure
                    .borrow_mut()
                    .take()
                    .expect("scope finalizer continuation consumed once")
            }),
        );
    }

    node
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_runs_finalizers_in_reverse_order() {
        let scope = Scope::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            let finalizer: Effect<(), ()> = Effect::sync(move || {
                log.borrow_mut().push(i);
            });
            scope.add_finalizer(finalizer);
        }

        let closing: Effect<(), ()> = scope.close();
        run_to_completion(closing);

        assert_eq!(*log.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn closing_twice_is_a_noop() {
        let scope = Scope::new();
        let ran = Rc::new(RefCell::new(0));
        {
            let ran = ran.clone();
            scope.add_finalizer(Effect::sync(move || {
                *ran.borrow_mut() += 1;
            }));
        }
        run_to_completion(scope.close::<()>());
        run_to_completion(scope.close::<()>());
        assert_eq!(*ran.borrow(), 1);
    }

    #[test]
    fn a_failing_finalizer_does_not_skip_the_rest() {
        let scope = Scope::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        scope.add_finalizer({
            let log = log.clone();
            Effect::<(), String>::sync(move || {
                log.borrow_mut().push("first");
            })
        });
        scope.add_finalizer(Effect::<(), String>::fail("boom".to_string()));
        scope.add_finalizer({
            let log = log.clone();
            Effect::<(), String>::sync(move || {
                log.borrow_mut().push("third");
            })
        });

        let exit = run_exit(scope.close::<String>());
        assert_eq!(*log.borrow(), vec!["third", "first"]);
        assert!(exit.is_failure());
    }

    #[test]
    fn closing_a_parent_closes_its_forked_children() {
        let parent = Scope::new();
        let child = parent.fork::<()>();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            child.add_finalizer(Effect::sync(move || {
                log.borrow_mut().push("child");
            }));
        }

        run_to_completion(parent.close::<()>());
        assert_eq!(*log.borrow(), vec!["child"]);
        assert!(!child.is_open());
    }

    #[test]
    fn a_child_closed_before_its_parent_does_not_run_twice() {
        let parent = Scope::new();
        let child = parent.fork::<()>();
        let ran = Rc::new(RefCell::new(0));
        {
            let ran = ran.clone();
            child.add_finalizer(Effect::sync(move || {
                *ran.borrow_mut() += 1;
            }));
        }

        run_to_completion(child.close::<()>());
        run_to_completion(parent.close::<()>());
        assert_eq!(*ran.borrow(), 1);
    }

    #[test]
    fn forking_an_already_closed_scope_yields_a_closed_child() {
        let parent = Scope::new();
        run_to_completion(parent.close::<()>());
        let child = parent.fork::<()>();
        assert!(!child.is_open());
    }

    fn run_to_completion<E: 'static>(effect: Effect<(), E>) {
        run_exit(effect);
    }

    fn run_exit<E: 'static>(effect: Effect<(), E>) -> crate::exit::Exit<(), E> {
        use crate::context::Context;
        use crate::exit::{Exit, RawExit};
        use crate::fiber::FiberHandle;
        use crate::scheduler::Scheduler;
        use std::cell::RefCell as StdRefCell;
        use std::rc::Rc as StdRc;

        let scheduler = Scheduler::new();
        let slot: StdRc<StdRefCell<Option<RawExit>>> = StdRc::new(StdRefCell::new(None));
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        let slot_clone = slot.clone();
        handle.on_exit(move |exit: &RawExit| {
            *slot_clone.borrow_mut() = Some(match exit {
                RawExit::Success(_) => RawExit::Success(Box::new(())),
                RawExit::Failure(c) => RawExit::Failure(c.clone()),
            });
        });
        scheduler.drain();
        Exit::from_raw(slot.borrow_mut().take().expect("fiber completed"))
    }
}
