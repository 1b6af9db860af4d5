// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Crate-local error taxonomy.
//!
//! Small enums and structs with hand-written `Display`/`Error` impls rather
//! than a derive-macro crate — the error surface here is intentionally tiny.

use std::fmt;

/// Returned when an operation targets a fiber, scope, or channel that has already
/// been torn down.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the target of this operation has already closed")
    }
}

impl std::error::Error for Closed {}

/// Errors that can occur while forking a new fiber.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SpawnError {
    /// The parent scope or fiber has already closed and is no longer accepting children.
    Closed,
    /// The scheduler's run queue could not accept another task (e.g. it has been shut down).
    SchedulerClosed,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Closed => f.write_str("cannot fork: parent has already closed"),
            SpawnError::SchedulerClosed => f.write_str("cannot fork: scheduler is no longer accepting tasks"),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        SpawnError::Closed
    }
}

/// Raised by [`crate::context::Context::get_service`] when a required service was
/// never provided.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct NoSuchElementError {
    pub(crate) service: &'static str,
}

impl fmt::Display for NoSuchElementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no service of type `{}` is present in this context", self.service)
    }
}

impl std::error::Error for NoSuchElementError {}

/// Raised by [`crate::concurrency::race::timeout`] when the wrapped effect did not
/// complete within the deadline.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Default)]
pub struct TimeoutError(pub(crate) ());

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline elapsed before the effect completed")
    }
}

impl std::error::Error for TimeoutError {}

/// Implemented by a typed failure enum that carries a stable per-variant
/// name, the discriminant [`crate::effect::Effect::catch_tag`] matches on
/// instead of pattern-matching the whole error type.
pub trait ErrorTag {
    fn error_tag(&self) -> &'static str;
}
