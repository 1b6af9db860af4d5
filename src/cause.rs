// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The causal error model: [`Cause`] aggregates zero or more [`Failure`]s that
//! occurred while evaluating an effect, distinguishing expected failures (`Fail`),
//! unexpected defects (`Die`), and structured interruption (`Interrupt`).

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::id::FiberId;

/// A type-erased annotation key, used to tag a [`Failure`] with side information
/// (e.g. a captured span, a retry count) without widening the `Cause` API.
pub type AnnotationKey = &'static str;

type BoxAny = Box<dyn Any>;

/// A single reason an effect failed to produce a value.
///
/// This is the type-erased representation used internally by the interpreter;
/// see [`Cause`] for the typed facade most code should use.
pub(crate) enum RawFailure {
    /// An expected, typed error produced by [`crate::effect::Effect::fail`] or similar.
    Fail {
        error: Rc<BoxAny>,
        annotations: Vec<(AnnotationKey, Rc<BoxAny>)>,
    },
    /// An unexpected defect: a Rust panic payload or a programming error surfaced via
    /// `Effect::die`.
    Die {
        defect: Rc<BoxAny>,
        annotations: Vec<(AnnotationKey, Rc<BoxAny>)>,
    },
    /// Structured interruption, optionally attributing the interrupting fiber.
    Interrupt { fiber: Option<FiberId> },
}

impl Clone for RawFailure {
    fn clone(&self) -> Self {
        match self {
            RawFailure::Fail { error, annotations } => RawFailure::Fail {
                error: error.clone(),
                annotations: annotations.clone(),
            },
            RawFailure::Die { defect, annotations } => RawFailure::Die {
                defect: defect.clone(),
                annotations: annotations.clone(),
            },
            RawFailure::Interrupt { fiber } => RawFailure::Interrupt { fiber: *fiber },
        }
    }
}

impl fmt::Debug for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFailure::Fail { .. } => f.debug_struct("Fail").finish_non_exhaustive(),
            RawFailure::Die { .. } => f.debug_struct("Die").finish_non_exhaustive(),
            RawFailure::Interrupt { fiber } => f.debug_struct("Interrupt").field("fiber", fiber).finish(),
        }
    }
}

/// A type-erased, ordered, deduplicated set of [`RawFailure`]s.
///
/// Ordering reflects the order failures were observed (parallel combinators
/// append right-hand failures after left-hand ones); duplicates introduced by
/// re-merging the same cause through multiple propagation paths are suppressed
/// on a best-effort, pointer-identity basis for `Fail`/`Die` and value-identity
/// for `Interrupt`.
#[derive(Clone, Debug, Default)]
pub(crate) struct RawCause {
    failures: Vec<RawFailure>,
}

impl RawCause {
    pub(crate) fn empty() -> Self {
        Self { failures: Vec::new() }
    }

    pub(crate) fn fail(error: BoxAny) -> Self {
        Self {
            failures: vec![RawFailure::Fail {
                error: Rc::new(error),
                annotations: Vec::new(),
            }],
        }
    }

    pub(crate) fn die(defect: BoxAny) -> Self {
        Self {
            failures: vec![RawFailure::Die {
                defect: Rc::new(defect),
                annotations: Vec::new(),
            }],
        }
    }

    pub(crate) fn interrupt(fiber: Option<FiberId>) -> Self {
        Self {
            failures: vec![RawFailure::Interrupt { fiber }],
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn failures(&self) -> &[RawFailure] {
        &self.failures
    }

    pub(crate) fn has_interrupt(&self) -> bool {
        self.failures.iter().any(|f| matches!(f, RawFailure::Interrupt { .. }))
    }

    pub(crate) fn has_fail(&self) -> bool {
        self.failures.iter().any(|f| matches!(f, RawFailure::Fail { .. }))
    }

    pub(crate) fn is_die_only(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| matches!(f, RawFailure::Die { .. }))
    }

    /// If this cause is exactly one `Fail`, consumes it and returns the owned
    /// error payload; otherwise returns `self` unchanged. Used by
    /// `Effect::catch_all` to recover from a straight-line typed failure while
    /// leaving compound (parallel) causes for `catch_all_cause` to handle.
    pub(crate) fn into_single_fail(mut self) -> Result<BoxAny, RawCause> {
        if self.failures.len() != 1 {
            return Err(self);
        }
        let failure = self.failures.pop().unwrap();
        let (error, annotations) = match failure {
            RawFailure::Fail { error, annotations } => (error, annotations),
            other => {
                self.failures.push(other);
                return Err(self);
            }
        };
        match Rc::try_unwrap(error) {
            Ok(boxed) => Ok(boxed),
            Err(rc) => {
                self.failures.push(RawFailure::Fail { error: rc, annotations });
                Err(self)
            }
        }
    }

    /// Sequential composition: `self` happened, then `other` happened while
    /// handling/finalizing `self`. Failures already present are not
    /// duplicated — first occurrence wins, later occurrences of the same
    /// failure (by pointer identity for `Fail`/`Die`, by fiber id for
    /// `Interrupt`) are dropped rather than appended again.
    pub(crate) fn then(mut self, other: RawCause) -> RawCause {
        for failure in other.failures {
            if !self.failures.iter().any(|existing| same_failure(existing, &failure)) {
                self.failures.push(failure);
            }
        }
        self
    }

    /// Parallel composition: `self` and `other` happened concurrently and neither
    /// "came after" the other causally.
    pub(crate) fn both(self, other: RawCause) -> RawCause {
        // Without a dedicated `Both`/`Then` tree this flattens to the same
        // ordered-union representation; callers that need to distinguish
        // causal shape can consult failure order and annotations.
        self.then(other)
    }

    pub(crate) fn annotate(mut self, key: AnnotationKey, value: BoxAny) -> RawCause {
        let value = Rc::new(value);
        for failure in &mut self.failures {
            match failure {
                RawFailure::Fail { annotations, .. } | RawFailure::Die { annotations, .. } => {
                    annotations.push((key, value.clone()));
                }
                RawFailure::Interrupt { .. } => {}
            }
        }
        self
    }

    /// Squash to a single representative defect, used when a cause must be
    /// rethrown as a single Rust panic payload (see `Effect::run_sync`).
    /// Preference order: the first `Fail`'s error; else the first `Die`'s
    /// defect; else an "interrupted" marker; else an "empty cause" marker.
    pub(crate) fn squash(&self) -> BoxAny {
        if let Some(RawFailure::Fail { error, .. }) = self.failures.iter().find(|f| matches!(f, RawFailure::Fail { .. })) {
            return clone_any_string(error);
        }
        if let Some(RawFailure::Die { defect, .. }) = self.failures.iter().find(|f| matches!(f, RawFailure::Die { .. })) {
            return clone_any_string(defect);
        }
        if let Some(RawFailure::Interrupt { fiber }) = self.failures.iter().find(|f| matches!(f, RawFailure::Interrupt { .. })) {
            let msg = match fiber {
                Some(id) => format!("fiber interrupted by {id}"),
                None => "fiber interrupted".to_string(),
            };
            return Box::new(msg);
        }
        Box::new("(empty cause)".to_string())
    }
}

/// Whether two failures represent "the same occurrence" for deduplication
/// purposes when merging causes: pointer identity for `Fail`/`Die` (the same
/// `Rc` payload re-observed through a second propagation path), value
/// identity for `Interrupt` (the same origin fiber, regardless of which
/// propagation path carried it).
fn same_failure(a: &RawFailure, b: &RawFailure) -> bool {
    match (a, b) {
        (RawFailure::Fail { error: a, .. }, RawFailure::Fail { error: b, .. }) => Rc::ptr_eq(a, b),
        (RawFailure::Die { defect: a, .. }, RawFailure::Die { defect: b, .. }) => Rc::ptr_eq(a, b),
        (RawFailure::Interrupt { fiber: a }, RawFailure::Interrupt { fiber: b }) => a == b,
        _ => false,
    }
}

fn clone_any_string(value: &Rc<BoxAny>) -> BoxAny {
    if let Some(s) = value.downcast_ref::<String>() {
        Box::new(s.clone())
    } else if let Some(s) = value.downcast_ref::<&'static str>() {
        Box::new(*s)
    } else {
        Box::new("(opaque failure)".to_string())
    }
}

/// A single reason a typed `Cause<E>` failed, with the `Fail` payload recovered
/// as `E`.
pub enum Failure<'a, E> {
    Fail(&'a E),
    Die(&'a (dyn Any)),
    Interrupt(Option<FiberId>),
}

/// The typed facade over [`RawCause`]. `Cause<E>` is the value carried by
/// `Effect::FailCause` and returned from `Exit::Failure`.
pub struct Cause<E> {
    pub(crate) raw: RawCause,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for Cause<E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cause").field("raw", &self.raw).finish()
    }
}

impl<E: 'static> Cause<E> {
    pub(crate) fn from_raw(raw: RawCause) -> Self {
        Self { raw, _marker: PhantomData }
    }

    pub fn fail(error: E) -> Self {
        Self::from_raw(RawCause::fail(Box::new(error)))
    }

    pub fn die<D: Any + 'static>(defect: D) -> Self {
        Self::from_raw(RawCause::die(Box::new(defect)))
    }

    pub fn interrupt(fiber: Option<FiberId>) -> Self {
        Self::from_raw(RawCause::interrupt(fiber))
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn has_interrupt(&self) -> bool {
        self.raw.has_interrupt()
    }

    pub fn has_fail(&self) -> bool {
        self.raw.has_fail()
    }

    /// `true` if every failure is a defect (no `Fail`, no `Interrupt`).
    pub fn is_die_only(&self) -> bool {
        self.raw.is_die_only()
    }

    pub fn then(self, other: Cause<E>) -> Cause<E> {
        Self::from_raw(self.raw.then(other.raw))
    }

    pub fn both(self, other: Cause<E>) -> Cause<E> {
        Self::from_raw(self.raw.both(other.raw))
    }

    pub fn annotate<A: Any + 'static>(self, key: AnnotationKey, value: A) -> Cause<E> {
        Self::from_raw(self.raw.annotate(key, Box::new(value)))
    }

    /// Iterate over the typed failures this cause carries, recovering `Fail`
    /// payloads as `&E`.
    pub fn failures(&self) -> impl Iterator<Item = Failure<'_, E>> {
        self.raw.failures().iter().map(|f| match f {
            RawFailure::Fail { error, .. } => Failure::Fail(error.downcast_ref::<E>().expect("Cause<E> invariant: Fail payload is E")),
            RawFailure::Die { defect, .. } => Failure::Die(defect.as_ref().as_ref()),
            RawFailure::Interrupt { fiber } => Failure::Interrupt(*fiber),
        })
    }

    /// The first `Fail(E)` payload in this cause, if any.
    pub fn failure(&self) -> Option<&E> {
        self.raw.failures().iter().find_map(|f| match f {
            RawFailure::Fail { error, .. } => Some(error.downcast_ref::<E>().expect("Cause<E> invariant")),
            _ => None,
        })
    }

    /// Collapse to a single defect for panicking call sites (`run_sync`'s
    /// "rethrow on Die" behavior).
    pub(crate) fn squash(&self) -> BoxAny {
        self.raw.squash()
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cause({} failure(s))", self.raw.failures().len())
    }
}
