// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mapping an effectful function over a collection, sequentially or with
//! bounded/unbounded concurrency.
//!
//! The sequential path rides [`crate::node::Node::Iterator`] directly — the
//! interpreter already drives a plain Rust iterator of nodes to completion one
//! at a time, which is exactly sequential `forEach`. The concurrent path is
//! grounded the same way [`crate::concurrency::race`] is: fork every
//! in-flight item as a structured child of the calling fiber and fan results
//! back in through `on_exit`, except here children are released from a
//! pending queue as the concurrency window allows instead of all at once.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cause::RawCause;
use crate::context::Context;
use crate::effect::{self, Effect};
use crate::exit::RawExit;
use crate::fiber::FiberHandle;
use crate::node::{BoxAny, Node};

/// How many items [`for_each`] may run at once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Concurrency {
    /// One item at a time, in order — the default.
    Sequential,
    /// Up to `n` items in flight at once.
    Bounded(usize),
    /// Every item forked immediately.
    Unbounded,
}

/// Options for [`for_each`].
#[derive(Clone, Copy, Debug)]
pub struct ForEachOptions {
    pub concurrency: Concurrency,
    /// If `true`, results are discarded and `for_each` always resolves with
    /// an empty `Vec` — useful when only the side effects matter, so the
    /// runtime doesn't need to hold every result in memory at once.
    pub discard: bool,
}

impl Default for ForEachOptions {
    fn default() -> Self {
        Self { concurrency: Concurrency::Sequential, discard: false }
    }
}

/// Runs `f` over every item in `items`, per `options`. Resolves with the
/// results in input order (or an empty `Vec`, if `options.discard`); fails
/// with the first failure observed (sequential: the first item that fails;
/// concurrent: the causal union of whichever in-flight items failed before
/// the rest could be interrupted).
pub fn for_each<T: 'static, A: Clone + 'static, E: 'static>(
    items: Vec<T>,
    f: impl Fn(T) -> Effect<A, E> + 'static,
    options: ForEachOptions,
) -> Effect<Vec<A>, E> {
    match options.concurrency {
        Concurrency::Sequential => for_each_sequential(items, f, options.discard),
        Concurrency::Bounded(n) => for_each_concurrent(items, f, Some(n.max(1)), options.discard),
        Concurrency::Unbounded => for_each_concurrent(items, f, None, options.discard),
    }
}

fn for_each_sequential<T: 'static, A: Clone + 'static, E: 'static>(
    items: Vec<T>,
    f: impl Fn(T) -> Effect<A, E> + 'static,
    discard: bool,
) -> Effect<Vec<A>, E> {
    let nodes: Vec<Node> = items.into_iter().map(|item| f(item).node).collect();
    let node = Node::Iterator(Box::new(nodes.into_iter()), Vec::new());
    let wrapped: Effect<Vec<BoxAny>, E> = effect::wrap(node);
    wrapped.map(move |raw| {
        if discard {
            return Vec::new();
        }
        raw.into_iter()
            .map(|boxed| *boxed.downcast::<A>().expect("for_each invariant: sequential result is A"))
            .collect()
    })
}

fn for_each_concurrent<T: 'static, A: Clone + 'static, E: 'static>(
    items: Vec<T>,
    f: impl Fn(T) -> Effect<A, E> + 'static,
    limit: Option<usize>,
    discard: bool,
) -> Effect<Vec<A>, E> {
    Effect::async_effect(move |fiber, resume| {
        let total = items.len();
        if total == 0 {
            resume.succeed(Box::new(Vec::<A>::new()));
            return None;
        }

        let window = limit.unwrap_or(total).max(1);
        let scheduler = fiber.scheduler();
        let context = fiber.context();
        let parent = fiber.handle();

        let pending: Rc<RefCell<VecDeque<(usize, T)>>> = Rc::new(RefCell::new(items.into_iter().enumerate().collect()));
        let f = Rc::new(f);
        let results: Rc<RefCell<Vec<Option<A>>>> = Rc::new(RefCell::new((0..total).map(|_| None).collect()));
        let children: Rc<RefCell<Vec<FiberHandle>>> = Rc::new(RefCell::new(Vec::with_capacity(total)));
        let remaining = Rc::new(Cell::new(total));
        let settled = Rc::new(Cell::new(false));
        let aborted = Rc::new(Cell::new(false));
        let aggregated: Rc<RefCell<RawCause>> = Rc::new(RefCell::new(RawCause::empty()));
        let resume = Rc::new(RefCell::new(Some(resume)));

        // Self-referential pump: spawns the next pending item (if any) and
        // wires its completion to spawn the next one after it, until either
        // the window or the pending queue runs dry.
        let pump: Rc<RefCell<Option<Rc<dyn Fn()>>>> = Rc::new(RefCell::new(None));
        let pump_handle = pump.clone();

        let pending_for_body = pending.clone();
        let f_for_body = f.clone();
        let context_for_body = context.clone();
        let scheduler_for_body = scheduler.clone();
        let parent_for_body = parent.clone();
        let results_for_body = results.clone();
        let children_for_body = children.clone();
        let remaining_for_body = remaining.clone();
        let settled_for_body = settled.clone();
        let aborted_for_body = aborted.clone();
        let aggregated_for_body = aggregated.clone();
        let resume_for_body = resume.clone();

        let body: Rc<dyn Fn()> = Rc::new(move || {
            if aborted_for_body.get() {
                return;
            }
            let Some((index, item)) = pending_for_body.borrow_mut().pop_front() else {
                return;
            };

            let child = FiberHandle::spawn(f_for_body(item).node, context_for_body.clone(), scheduler_for_body.clone(), Some(&parent_for_body));
            children_for_body.borrow_mut().push(child.clone());

            let results = results_for_body.clone();
            let children = children_for_body.clone();
            let remaining = remaining_for_body.clone();
            let settled = settled_for_body.clone();
            let aborted = aborted_for_body.clone();
            let aggregated = aggregated_for_body.clone();
            let resume = resume_for_body.clone();
            let pending = pending_for_body.clone();
            let pump_cb = pump_handle.clone();

            child.on_exit(move |exit: &RawExit| {
                match exit {
                    RawExit::Success(v) if !discard => {
                        let value = v.downcast_ref::<A>().expect("for_each invariant: branch result is A").clone();
                        results.borrow_mut()[index] = Some(value);
                    }
                    RawExit::Success(_) => {}
                    RawExit::Failure(cause) => {
                        aborted.set(true);
                        pending.borrow_mut().clear();
                        let mut agg = aggregated.borrow_mut();
                        let taken = std::mem::replace(&mut *agg, RawCause::empty());
                        *agg = taken.then(cause.clone());
                        drop(agg);
                        for sibling in children.borrow().iter() {
                            sibling.unsafe_interrupt(None);
                        }
                    }
                }

                remaining.set(remaining.get() - 1);

                if remaining.get() == 0 {
                    if !settled.get() {
                        settled.set(true);
                        if let Some(resume) = resume.borrow_mut().take() {
                            let agg = aggregated.borrow();
                            if agg.is_empty() {
                                let values: Vec<A> = if discard {
                                    Vec::new()
                                } else {
                                    results
                                        .borrow_mut()
                                        .drain(..)
                                        .map(|v| v.expect("for_each invariant: every slot filled when no failure occurred"))
                                        .collect()
                                };
                                resume.succeed(Box::new(values));
                            } else {
                                resume.fail_cause(agg.clone());
                            }
                        }
                    }
                    return;
                }

                if let Some(pump) = pump_cb.borrow().as_ref() {
                    pump();
                }
            });
        });

        *pump.borrow_mut() = Some(body.clone());
        for _ in 0..window.min(total) {
            body();
        }

        None
    })
}
