// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Effect`]: the public, statically-typed description of a computation.
//!
//! An `Effect<A, E>` is a thin, zero-cost wrapper over the untyped [`Node`] IR
//! (see `node.rs` for why the interior is erased). Every combinator here does
//! the same thing: build a bigger `Node` out of smaller ones, and carry the
//! compile-time promise of what it will eventually produce in a `PhantomData`.
//! Nothing here actually *runs* anything; see `fiber.rs` for the interpreter
//! and `runtime.rs` for the `run_*` entry points.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::cause::{Cause, RawCause};
use crate::context::{Context, ReferenceTag, Tag};
use crate::error::NoSuchElementError;
use crate::exit::Exit;
use crate::fiber::Fiber;
use crate::fiber_ref::FiberRef;
use crate::node::{BoxAny, Canceler, Node, Outcome, Resume};

/// A description of a computation that either produces an `A` or fails with a
/// [`Cause<E>`] describing why.
///
/// `Effect` values are immutable and inert: building one does no work. Use one
/// of the `run_*` functions in [`crate::runtime`] to actually evaluate it.
#[must_use = "effects do nothing until they are run"]
pub struct Effect<A, E> {
    pub(crate) node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

pub(crate) fn wrap<A, E>(node: Node) -> Effect<A, E> {
    Effect { node, _marker: PhantomData }
}

fn downcast<T: 'static>(v: BoxAny) -> T {
    *v.downcast::<T>().expect("Effect<A, E> invariant: value has the promised type")
}

impl<A: 'static, E: 'static> Effect<A, E> {
    /// An effect that immediately succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        wrap(Node::Succeed(Box::new(value)))
    }

    /// An effect that immediately fails with `error`.
    pub fn fail(error: E) -> Self {
        wrap(Node::FailCause(RawCause::fail(Box::new(error))))
    }

    /// An effect that immediately fails with a fully-formed [`Cause<E>`].
    pub fn fail_cause(cause: Cause<E>) -> Self {
        wrap(Node::FailCause(cause.raw))
    }

    /// An effect that fails with an unrecoverable defect: a programming error
    /// that isn't part of `E`'s expected failure domain.
    pub fn die<D: Any + 'static>(defect: D) -> Self {
        wrap(Node::FailCause(RawCause::die(Box::new(defect))))
    }

    /// Lifts a synchronous, infallible Rust closure. A panic inside `f` is
    /// captured and turned into a `Die`, not propagated as a host panic.
    pub fn sync(f: impl FnOnce() -> A + 'static) -> Self {
        wrap(Node::Sync(Box::new(move || Box::new(f()))))
    }

    /// Defers constructing an effect until it is actually run, re-evaluating
    /// `f` every time (useful for effects that must not be built eagerly,
    /// e.g. ones that capture `&mut` state at construction time otherwise).
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + 'static) -> Self {
        wrap(Node::Suspend(Box::new(move || f().node)))
    }

    /// Registers a callback-based asynchronous operation. `register` is handed
    /// a [`Resume`] to call (at most once) with the operation's outcome, and
    /// may return a [`Canceler`] the runtime invokes if the fiber is
    /// interrupted while suspended waiting on it.
    pub fn async_effect(register: impl FnOnce(&mut Fiber, AsyncResume<A, E>) -> Option<Canceler> + 'static) -> Self {
        wrap(Node::Async(Box::new(move |fiber, resume| register(fiber, AsyncResume::new(resume)))))
    }

    /// Exposes the running [`Fiber`] (identity, context, scheduler) to build
    /// an effect that depends on it, without suspending.
    pub fn with_fiber(f: impl FnOnce(&mut Fiber) -> Effect<A, E> + 'static) -> Self {
        wrap(Node::WithFiber(Box::new(move |fiber| f(fiber).node)))
    }

    /// Lifts an already-computed [`Exit<A, E>`] back into the effect algebra.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Effect::succeed(a),
            Exit::Failure(c) => Effect::fail_cause(c),
        }
    }

    /// Fails the running fiber with structured interruption, attributing the
    /// fiber itself as the origin — the self-interruption counterpart to
    /// `fail`/`die`. Unlike [`crate::fiber::FiberHandle::unsafe_interrupt`]
    /// called from another fiber, this runs inline as an ordinary primitive
    /// in the fiber's own instruction stream, so it does not defer inside an
    /// enclosing `uninterruptible` region the way asynchronous interruption
    /// does.
    pub fn interrupt() -> Self {
        Effect::with_fiber(|fiber| Effect::fail_cause(Cause::interrupt(Some(fiber.id()))))
    }

    /// Runs `f` synchronously and unwraps its `Result`: `Ok(a)` succeeds with
    /// `a`, `Err(e)` fails with `e`. A Rust panic inside `f` is still captured
    /// as a `Die`, the same contract [`Effect::sync`] has.
    pub fn try_promise(f: impl FnOnce() -> Result<A, E> + 'static) -> Effect<A, E> {
        Effect::<Result<A, E>, E>::sync(f).flat_map(|result| match result {
            Ok(a) => Effect::succeed(a),
            Err(e) => Effect::fail(e),
        })
    }

    /// Builds a [`crate::concurrency::Promise`], hands it to `register` (which
    /// runs eagerly, right here, not deferred to when this effect is run —
    /// typically to stash the promise somewhere another fiber can resolve
    /// it), then suspends until that promise resolves.
    pub fn promise(register: impl FnOnce(crate::concurrency::Promise<A, E>) + 'static) -> Effect<A, E>
    where
        A: Clone,
    {
        let p = crate::concurrency::Promise::new();
        register(p.clone());
        p.await_value()
    }

    // --- sequencing -------------------------------------------------------

    pub fn map<B: 'static>(self, f: impl FnOnce(A) -> B + 'static) -> Effect<B, E> {
        wrap(Node::OnSuccess(Box::new(self.node), Box::new(move |v| Node::Succeed(Box::new(f(downcast::<A>(v)))))))
    }

    pub fn map_error<E2: 'static>(self, f: impl FnOnce(Cause<E>) -> Cause<E2> + 'static) -> Effect<A, E2> {
        wrap(Node::OnFailure(
            Box::new(self.node),
            Box::new(move |c| Node::FailCause(f(Cause::from_raw(c)).raw)),
        ))
    }

    pub fn flat_map<B: 'static>(self, f: impl FnOnce(A) -> Effect<B, E> + 'static) -> Effect<B, E> {
        wrap(Node::OnSuccess(Box::new(self.node), Box::new(move |v| f(downcast::<A>(v)).node)))
    }

    /// Alias for [`Effect::flat_map`], matching the common "and then run this"
    /// naming used by sequential combinator APIs.
    pub fn and_then<B: 'static>(self, f: impl FnOnce(A) -> Effect<B, E> + 'static) -> Effect<B, E> {
        self.flat_map(f)
    }

    /// Runs `self`, then runs `f` against both outcomes, producing a brand new
    /// result type. This is the most general sequencing primitive; `map`,
    /// `flat_map`, `catch`, and `catch_all` are all expressible in terms of it
    /// but are kept as separate methods for clarity at call sites.
    pub fn match_cause<B: 'static>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> Effect<B, E> + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E> + 'static,
    ) -> Effect<B, E> {
        wrap(Node::OnSuccessAndFailure(
            Box::new(self.node),
            Box::new(move |v| on_success(downcast::<A>(v)).node),
            Box::new(move |c| on_failure(Cause::from_raw(c)).node),
        ))
    }

    /// Runs `f` for its side effect after `self` succeeds, discarding `f`'s
    /// result and keeping `self`'s.
    pub fn tap(self, f: impl FnOnce(&A) -> Effect<(), E> + 'static) -> Effect<A, E>
    where
        A: Clone,
    {
        self.flat_map(move |a| {
            let a2 = a.clone();
            f(&a).map(move |()| a2)
        })
    }

    /// Runs `self`, then `other`, pairing both successes into a tuple. Always
    /// sequential, left then right — there is no concurrency option here, use
    /// [`crate::concurrency::for_each`] for that.
    pub fn zip<B: 'static>(self, other: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| other.map(move |b| (a, b)))
    }

    /// Like [`Effect::zip`], but combines both successes with `f` instead of
    /// pairing them into a tuple.
    pub fn zip_with<B: 'static, C: 'static>(self, other: Effect<B, E>, f: impl FnOnce(A, B) -> C + 'static) -> Effect<C, E> {
        self.flat_map(move |a| other.map(move |b| f(a, b)))
    }

    /// Fails with `or_fail_with(&a)` if `predicate` rejects the success
    /// value, otherwise passes it through unchanged.
    pub fn filter(self, predicate: impl FnOnce(&A) -> bool + 'static, or_fail_with: impl FnOnce(&A) -> E + 'static) -> Effect<A, E> {
        self.flat_map(move |a| {
            if predicate(&a) {
                Effect::succeed(a)
            } else {
                let error = or_fail_with(&a);
                Effect::fail(error)
            }
        })
    }

    /// Maps the success value through `f`; `None` fails with
    /// `or_fail_with()`, `Some(b)` passes `b` through.
    pub fn filter_map<B: 'static>(self, f: impl FnOnce(A) -> Option<B> + 'static, or_fail_with: impl FnOnce() -> E + 'static) -> Effect<B, E> {
        self.flat_map(move |a| match f(a) {
            Some(b) => Effect::succeed(b),
            None => Effect::fail(or_fail_with()),
        })
    }

    // --- error handling -----------------------------------------------------

    /// Recovers from any failure cause, producing a new effect in its place.
    pub fn catch_all_cause(self, f: impl FnOnce(Cause<E>) -> Effect<A, E> + 'static) -> Effect<A, E> {
        wrap(Node::OnFailure(Box::new(self.node), Box::new(move |c| f(Cause::from_raw(c)).node)))
    }

    /// Recovers from a single typed `Fail(E)`; defects, interruption, and
    /// compound (parallel) causes still propagate unchanged — use
    /// [`Effect::catch_all_cause`] to handle those.
    pub fn catch_all(self, f: impl FnOnce(E) -> Effect<A, E> + 'static) -> Effect<A, E> {
        self.catch_all_cause(move |cause| match cause.raw.into_single_fail() {
            Ok(error) => f(downcast::<E>(error)),
            Err(raw) => Effect::fail_cause(Cause::from_raw(raw)),
        })
    }

    /// Recovers only from a typed failure whose [`crate::error::ErrorTag::error_tag`]
    /// matches `tag`; any other failure — a different tag, a defect,
    /// interruption, or a compound cause — propagates unchanged.
    pub fn catch_tag(self, tag: &'static str, f: impl FnOnce(E) -> Effect<A, E> + 'static) -> Effect<A, E>
    where
        E: crate::error::ErrorTag,
    {
        self.catch_all(move |error| if error.error_tag() == tag { f(error) } else { Effect::fail(error) })
    }

    /// Exposes the full [`Cause<E>`] — typed fails, defects, and
    /// interruption alike — as this effect's own typed failure, so a handler
    /// can pattern-match across all three instead of only `Fail`.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        wrap(Node::OnFailure(
            Box::new(self.node),
            Box::new(|c| Node::FailCause(RawCause::fail(Box::new(Cause::<E>::from_raw(c))))),
        ))
    }

    /// Converts any outcome — success, failure, or interruption — into a
    /// success value carrying the [`Exit`], never failing itself. The
    /// inverse of [`Effect::from_exit`].
    pub fn exit<E2: 'static>(self) -> Effect<Exit<A, E>, E2> {
        wrap(Node::OnSuccessAndFailure(
            Box::new(self.node),
            Box::new(|v| Node::Succeed(Box::new(Exit::<A, E>::Success(downcast::<A>(v))))),
            Box::new(|c| Node::Succeed(Box::new(Exit::<A, E>::Failure(Cause::from_raw(c))))),
        ))
    }

    /// Ensures `finalizer` runs after `self` completes, regardless of whether
    /// it succeeded, failed, or was interrupted, without observing the
    /// outcome. See [`Effect::on_exit`] to observe it.
    pub fn ensuring(self, finalizer: impl FnOnce() -> Effect<(), E> + 'static) -> Effect<A, E> {
        self.on_exit(move |_| finalizer())
    }

    /// Runs `handler` with the [`Exit<A, E>`] once `self` completes, then
    /// re-propagates the original outcome (the handler's own result is used
    /// only for sequencing; its failures are appended to the original cause).
    pub fn on_exit(self, handler: impl FnOnce(&Exit<(), E>) -> Effect<(), E> + 'static) -> Effect<A, E>
    where
        E: 'static,
    {
        wrap(Node::OnSuccessAndFailure(
            Box::new(self.node),
            Box::new(move |v| {
                let exit = Exit::<(), E>::Success(());
                run_finalizer(handler(&exit), Outcome::Success(v))
            }),
            Box::new(move |c| {
                let exit = Exit::<(), E>::Failure(Cause::from_raw(c.clone()));
                run_finalizer(handler(&exit), Outcome::Failure(c))
            }),
        ))
    }

    /// Like [`Effect::on_exit`] but only observes failures.
    pub fn on_error(self, handler: impl FnOnce(&Cause<E>) -> Effect<(), E> + 'static) -> Effect<A, E> {
        wrap(Node::OnFailure(
            Box::new(self.node),
            Box::new(move |c| {
                let typed = Cause::from_raw(c.clone());
                run_finalizer(handler(&typed), Outcome::Failure(c))
            }),
        ))
    }

    /// Runs `handler` if (and only if) `self` is interrupted; the handler's
    /// own effect is sequenced before the interruption cause re-propagates.
    pub fn on_interrupt(self, handler: impl FnOnce() -> Effect<(), E> + 'static) -> Effect<A, E> {
        wrap(Node::AsyncFinalizer(Box::new(move || handler().node), Box::new(self.node)))
    }

    // --- interruptibility ---------------------------------------------------

    pub fn interruptible(self) -> Effect<A, E> {
        wrap(Node::SetInterruptible(true, Box::new(self.node)))
    }

    pub fn uninterruptible(self) -> Effect<A, E> {
        wrap(Node::SetInterruptible(false, Box::new(self.node)))
    }

    /// Runs `f`'s result uninterruptibly, handing it a [`Restore`] token it
    /// can apply to carve out an island of interruptibility inside the
    /// otherwise-uninterruptible region (see [`Semaphore::with_permits`] for
    /// the canonical use: acquire/release stay uninterruptible, the body
    /// in between runs under `restore`).
    ///
    /// [`Semaphore::with_permits`]: crate::concurrency::semaphore::Semaphore::with_permits
    pub fn uninterruptible_mask(f: impl FnOnce(Restore) -> Effect<A, E> + 'static) -> Effect<A, E> {
        let body = f(Restore(()));
        wrap(Node::SetInterruptible(false, Box::new(body.node)))
    }

    // --- looping -------------------------------------------------------------

    /// Runs `f()`'s effect in an unbounded loop, discarding every success and
    /// looping again — the only way out is a failure or interruption. Rides
    /// [`Node::While`], so an auto-yield budget still applies to it like any
    /// other loop the interpreter drives.
    pub fn forever(f: impl Fn() -> Effect<A, E> + 'static) -> Effect<A, E> {
        wrap(Node::While { cond: Box::new(|| true), body: Box::new(move || f().node) })
    }

    /// Runs `f()`, then keeps rerunning it as long as `while_predicate`
    /// accepts the previous success value, returning the last rejected
    /// value once it stops. The first failure (`f()` never retries on its
    /// own) propagates immediately.
    pub fn repeat(f: impl Fn() -> Effect<A, E> + 'static, while_predicate: impl FnMut(&A) -> bool + 'static) -> Effect<A, E> {
        fn step<A: 'static, E: 'static>(
            f: Rc<dyn Fn() -> Effect<A, E>>,
            predicate: Rc<std::cell::RefCell<dyn FnMut(&A) -> bool>>,
        ) -> Effect<A, E> {
            f().flat_map(move |a| {
                let again = (predicate.borrow_mut())(&a);
                if again {
                    step(f, predicate)
                } else {
                    Effect::succeed(a)
                }
            })
        }
        step(Rc::new(f), Rc::new(std::cell::RefCell::new(while_predicate)))
    }

    /// Runs `f()`; on an ordinary failure (interruption always propagates
    /// immediately) reruns it, up to `max_attempts` more times, returning the
    /// first success or the last failure once attempts run out.
    pub fn retry(f: impl Fn() -> Effect<A, E> + 'static, max_attempts: usize) -> Effect<A, E> {
        fn step<A: 'static, E: 'static>(f: Rc<dyn Fn() -> Effect<A, E>>, attempts_left: usize) -> Effect<A, E> {
            let attempt = f();
            if attempts_left == 0 {
                return attempt;
            }
            attempt.catch_all_cause(move |cause| {
                if cause.has_interrupt() {
                    Effect::fail_cause(cause)
                } else {
                    step(f, attempts_left - 1)
                }
            })
        }
        step(Rc::new(f), max_attempts)
    }

    // --- context -------------------------------------------------------------

    /// Runs `self` with `T::Value` bound in the fiber's `Context` for the
    /// duration of `self`, restoring the previous binding afterward.
    pub fn provide<T: Tag>(self, value: T::Value) -> Effect<A, E> {
        Effect::with_fiber(move |fiber| {
            let child_ctx = fiber.context().with::<T>(value);
            wrap(Node::WithContext(child_ctx, Box::new(self.node)))
        })
    }

    pub fn provide_reference<R: ReferenceTag>(self, value: R::Value) -> Effect<A, E> {
        Effect::with_fiber(move |fiber| {
            let child_ctx = fiber.context().with_reference::<R>(value);
            wrap(Node::WithContext(child_ctx, Box::new(self.node)))
        })
    }

    /// Runs `self` under an entirely different [`Context`], rather than
    /// layering one more service onto the current one the way
    /// [`Effect::provide`] does, restoring the previous context afterward.
    pub fn provide_context(self, ctx: Context) -> Effect<A, E> {
        wrap(Node::WithContext(ctx, Box::new(self.node)))
    }

    /// Alias for [`Effect::provide`], named to match the rest of this
    /// surface's `service`/`service_option` naming for binding a single
    /// required service.
    pub fn provide_service<T: Tag>(self, value: T::Value) -> Effect<A, E> {
        self.provide::<T>(value)
    }

    /// Runs `self` with `T`'s current binding replaced by `f` applied to it.
    /// Dies with [`NoSuchElementError`] if `T` was never bound — the same
    /// contract [`crate::effect::service`] has.
    pub fn update_service<T: Tag>(self, f: impl FnOnce(std::rc::Rc<T::Value>) -> T::Value + 'static) -> Effect<A, E> {
        Effect::with_fiber(move |fiber| match fiber.context().get_service::<T>() {
            Some(current) => self.provide::<T>(f(current)),
            None => Effect::die(NoSuchElementError { service: std::any::type_name::<T>() }),
        })
    }

    // --- forking -------------------------------------------------------------

    /// Forks `self` as a structured child of the running fiber: it inherits
    /// the parent's context, and is interrupted if the parent finishes
    /// first. Returns immediately with a [`FiberRef`] without waiting for
    /// the child to do anything. `E2` is the caller's own error channel —
    /// forking itself cannot fail.
    pub fn fork<E2: 'static>(self) -> Effect<FiberRef<A, E>, E2> {
        Effect::with_fiber(move |fiber| {
            let child = crate::fiber::FiberHandle::spawn(self.node, fiber.context(), fiber.scheduler(), Some(&fiber.handle()));
            Effect::succeed(FiberRef::new(child))
        })
    }

    /// Like [`Effect::fork`], but the child has no parent link: it is not
    /// interrupted when the forking fiber finishes.
    pub fn fork_daemon<E2: 'static>(self) -> Effect<FiberRef<A, E>, E2> {
        Effect::with_fiber(move |fiber| {
            let child = crate::fiber::FiberHandle::spawn(self.node, fiber.context(), fiber.scheduler(), None);
            Effect::succeed(FiberRef::new(child))
        })
    }

    /// Forks `self` into a child of `scope` rather than of the running fiber:
    /// the child still inherits the running fiber's context, but `scope`
    /// (not the running fiber) gets a finalizer that interrupts the child
    /// when it closes.
    pub fn fork_in<E2: 'static>(self, scope: &crate::scope::Scope) -> Effect<FiberRef<A, E>, E2> {
        let scope = scope.clone();
        Effect::with_fiber(move |fiber| {
            let child = crate::fiber::FiberHandle::spawn(self.node, fiber.context(), fiber.scheduler(), None);
            let to_interrupt = child.clone();
            scope.add_finalizer_node(Node::WithFiber(Box::new(move |fiber| {
                to_interrupt.unsafe_interrupt(Some(fiber.id()));
                Node::Succeed(Box::new(()))
            })));
            Effect::succeed(FiberRef::new(child))
        })
    }

    /// Like [`Effect::fork`], but the child is attached to the nearest
    /// enclosing [`crate::scope::Scope`] (see [`Effect::scoped`]) instead of
    /// the forking fiber directly: closing that scope interrupts the child,
    /// same as calling [`Effect::fork_in`] with that scope explicitly. Dies
    /// with [`NoSuchElementError`] if there is no open scope in context.
    pub fn fork_scoped<E2: 'static>(self) -> Effect<FiberRef<A, E>, E2> {
        Effect::with_fiber(move |fiber| match fiber.context().get_service::<crate::scope::ScopeService>() {
            Some(scope) => self.fork_in(&scope),
            None => Effect::die(NoSuchElementError { service: "Scope" }),
        })
    }

    // --- scoping ---------------------------------------------------------------

    /// Runs `self` under a fresh [`crate::scope::Scope`] bound in its context,
    /// then closes that scope — running every finalizer registered against it
    /// via [`crate::scope::acquire_release`] or [`Effect::fork_in`] — on every
    /// exit path, success, failure, or interruption alike.
    pub fn scoped(self) -> Effect<A, E> {
        Effect::with_fiber(move |fiber| {
            let scope = crate::scope::Scope::new();
            let child_ctx = fiber.context().with::<crate::scope::ScopeService>(scope.clone());
            wrap::<A, E>(Node::WithContext(child_ctx, Box::new(self.node))).ensuring(move || scope.close::<E>())
        })
    }
}

/// Runs every effect in `effects` to completion in order, left to right,
/// collecting their successes; fails with the first failure encountered
/// (effects after it never run). The fixed-arity sibling of
/// [`crate::concurrency::for_each`] run with `Concurrency::Sequential` —
/// grounded on the same [`Node::Iterator`] primitive.
pub fn all<A: 'static, E: 'static>(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
    let nodes: Vec<Node> = effects.into_iter().map(|e| e.node).collect();
    let node = Node::Iterator(Box::new(nodes.into_iter()), Vec::new());
    let wrapped: Effect<Vec<BoxAny>, E> = wrap(node);
    wrapped.map(|raw| raw.into_iter().map(downcast::<A>).collect())
}

/// Reads a service required via [`Effect::provide`]/[`Effect::provide_service`];
/// dies with [`NoSuchElementError`] if it was never bound, the same contract
/// [`crate::time::TimerService`] has for [`crate::time::sleep`].
pub fn service<T: Tag, E: 'static>() -> Effect<Rc<T::Value>, E> {
    Effect::with_fiber(|fiber| match fiber.context().get_service::<T>() {
        Some(value) => Effect::succeed(value),
        None => Effect::die(NoSuchElementError { service: std::any::type_name::<T>() }),
    })
}

/// Like [`service`], but never fails — a missing binding resolves to `None`.
pub fn service_option<T: Tag, E: 'static>() -> Effect<Option<Rc<T::Value>>, E> {
    Effect::with_fiber(|fiber| Effect::succeed(fiber.context().get_service::<T>()))
}

/// Reads the running fiber's current [`Context`] wholesale.
pub fn context<E: 'static>() -> Effect<Context, E> {
    Effect::with_fiber(|fiber| Effect::succeed(fiber.context()))
}

/// Runs `finalizer`, discards its own success, then restores `original` —
/// appending the finalizer's own failure (if any) rather than swallowing it.
fn run_finalizer<E: 'static>(finalizer: Effect<(), E>, original: Outcome) -> Node {
    let original = std::rc::Rc::new(std::cell::RefCell::new(Some(original)));
    let restore_success = original.clone();
    let restore_failure = original;
    Node::OnSuccessAndFailure(
        Box::new(finalizer.node),
        Box::new(move |_| restore_success.borrow_mut().take().expect("run_finalizer outcome consumed twice").into_node()),
        Box::new(move |finalizer_cause| {
            match restore_failure.borrow_mut().take().expect("run_finalizer outcome consumed twice") {
                Outcome::Failure(c) => Node::FailCause(c.then(finalizer_cause)),
                Outcome::Success(_) => Node::FailCause(finalizer_cause),
            }
        }),
    )
}

/// Token handed to the closure in [`Effect::uninterruptible_mask`]; applying
/// it to an effect re-enables interruption for that effect specifically,
/// while the rest of the enclosing mask stays uninterruptible.
pub struct Restore(());

impl Restore {
    pub fn apply<A: 'static, E: 'static>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        wrap(Node::SetInterruptible(true, Box::new(effect.node)))
    }
}

/// A type-safe handle to call back into a suspended [`Effect::async_effect`]
/// registration, wrapping [`Resume`] with the effect's declared success/error
/// types.
pub struct AsyncResume<A, E> {
    inner: Resume,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: 'static, E: 'static> AsyncResume<A, E> {
    fn new(inner: Resume) -> Self {
        Self { inner, _marker: PhantomData }
    }

    pub fn succeed(self, value: A) {
        self.inner.succeed(Box::new(value));
    }

    pub fn fail(self, error: E) {
        self.inner.fail_cause(RawCause::fail(Box::new(error)));
    }

    pub fn fail_cause(self, cause: Cause<E>) {
        self.inner.fail_cause(cause.raw);
    }

    /// Drops the static success/error types, handing back the raw [`Resume`]
    /// for primitives (timers, channels) that live below the typed facade and
    /// resume fibers with already-erased outcomes.
    pub(crate) fn into_resume(self) -> Resume {
        self.inner
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
        let exit_slot = std::rc::Rc::new(std::cell::RefCell::new(None));
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        let slot = exit_slot.clone();
        handle.on_exit(move |exit| {
            *slot.borrow_mut() = Some(match exit {
                crate::exit::RawExit::Success(v) => {
                    crate::exit::RawExit::Success(Box::new(v.downcast_ref::<A>().unwrap().clone()))
                }
                crate::exit::RawExit::Failure(c) => crate::exit::RawExit::Failure(c.clone()),
            });
        });
        scheduler.drain();
        Exit::from_raw(exit_slot.borrow_mut().take().expect("fiber did not publish an exit"))
    }

    #[test]
    fn map_transforms_success_value() {
        let exit = run::<i32, ()>(Effect::succeed(1).map(|n| n + 41));
        assert!(matches!(exit, Exit::Success(42)));
    }

    #[test]
    fn flat_map_sequences_effects() {
        let exit = run::<i32, ()>(Effect::succeed(1).flat_map(|n| Effect::succeed(n + 1)).flat_map(|n| Effect::succeed(n * 10)));
        assert!(matches!(exit, Exit::Success(20)));
    }

    #[test]
    fn fail_short_circuits_map() {
        let exit = run::<i32, &str>(Effect::fail("boom").map(|n: i32| n + 1));
        match exit {
            Exit::Failure(cause) => assert_eq!(cause.failure(), Some(&"boom")),
            Exit::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn catch_all_recovers_from_typed_failure() {
        let exit = run::<i32, &str>(Effect::fail("boom").catch_all(|_| Effect::succeed(7)));
        assert!(matches!(exit, Exit::Success(7)));
    }

    #[test]
    fn scoped_releases_acquired_resources_on_success() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let effect: Effect<i32, ()> = {
            let log = log.clone();
            crate::scope::acquire_release(Effect::sync(move || 1), {
                let log = log.clone();
                move |n: i32| {
                    Effect::sync(move || {
                        log.borrow_mut().push(n);
                    })
                }
            })
            .tap(move |_| {
                let log = log.clone();
                Effect::sync(move || log.borrow_mut().push(99))
            })
            .scoped()
        };
        let exit = run(effect);
        assert!(matches!(exit, Exit::Success(1)));
        assert_eq!(*log.borrow(), vec![99, 1]);
    }

    #[test]
    fn fork_in_interrupts_the_child_when_its_scope_closes() {
        let scheduler = Scheduler::new();
        let scope = crate::scope::Scope::new();

        let never: Effect<(), ()> = Effect::async_effect(|_fiber, _resume| None);
        let forking: Effect<FiberRef<(), ()>, ()> = never.fork_in(&scope);
        let parent = FiberHandle::spawn(forking.node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();

        let child_ref: FiberRef<(), ()> = match parent.exit().expect("fork_in resolves synchronously").as_ref() {
            crate::exit::RawExit::Success(v) => v.downcast_ref::<FiberRef<(), ()>>().unwrap().clone(),
            crate::exit::RawExit::Failure(_) => panic!("forking cannot fail"),
        };
        assert!(!child_ref.is_done());

        FiberHandle::spawn(scope.close::<()>().node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();
        assert!(child_ref.is_done());
    }

    #[test]
    fn scoped_runs_release_even_when_the_body_fails() {
        let released = std::rc::Rc::new(std::cell::Cell::new(false));
        let effect: Effect<(), &str> = crate::scope::acquire_release(Effect::succeed(()), {
            let released = released.clone();
            move |()| {
                Effect::sync(move || {
                    released.set(true);
                })
            }
        })
        .flat_map(|()| Effect::fail("boom"))
        .scoped();

        let exit = run(effect);
        assert!(exit.is_failure());
        assert!(released.get());
    }

    #[test]
    fn uninterruptible_deferral_delays_the_interrupt_until_the_region_reopens() {
        let scheduler = Scheduler::new();
        let resume_slot: std::rc::Rc<std::cell::RefCell<Option<Resume>>> = std::rc::Rc::new(std::cell::RefCell::new(None));
        let slot = resume_slot.clone();
        let suspended: Effect<(), ()> = Effect::async_effect(move |_fiber, resume| {
            *slot.borrow_mut() = Some(resume.into_resume());
            None
        });
        let effect = suspended.uninterruptible();
        let handle = FiberHandle::spawn(effect.node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();
        assert!(!handle.is_done());

        handle.unsafe_interrupt(None);
        scheduler.drain();
        assert!(!handle.is_done(), "an interrupt requested while uninterruptible must be deferred, not delivered");

        let resume = resume_slot.borrow_mut().take().expect("the async registration stashed its resume");
        resume.succeed(Box::new(()));
        scheduler.drain();

        assert!(handle.is_done());
        let exit = handle.exit().expect("fiber published an exit");
        assert!(
            matches!(&*exit, crate::exit::RawExit::Failure(c) if c.has_interrupt()),
            "the deferred interrupt must still take effect once the uninterruptible region closes"
        );
    }

    #[test]
    fn interrupt_structured_interrupts_forked_children_when_the_parent_is_interrupted() {
        let scheduler = Scheduler::new();
        let child_ref_slot: std::rc::Rc<std::cell::RefCell<Option<FiberRef<(), ()>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let slot = child_ref_slot.clone();

        let never_child: Effect<(), ()> = Effect::async_effect(|_fiber, _resume| None);
        let never_parent_body: Effect<(), ()> = Effect::async_effect(|_fiber, _resume| None);
        let parent_effect: Effect<(), ()> = never_child.fork::<()>().flat_map(move |child| {
            *slot.borrow_mut() = Some(child);
            never_parent_body
        });

        let parent = FiberHandle::spawn(parent_effect.node, Context::empty(), scheduler.clone(), None);
        scheduler.drain();

        let child_ref = child_ref_slot.borrow_mut().take().expect("fork resolves synchronously");
        assert!(!child_ref.is_done());
        assert!(!parent.is_done());

        parent.unsafe_interrupt(None);
        scheduler.drain();

        assert!(parent.is_done());
        assert!(child_ref.is_done(), "interrupting the parent must also interrupt its structured child");
    }
}
