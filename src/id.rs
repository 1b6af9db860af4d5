// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a fiber relative to all other currently
/// running fibers.
///
/// # Notes
///
/// - IDs are unique relative to other *currently running* fibers. Once a fiber
///   publishes its exit its ID may, in principle, be reused by a later fiber.
/// - IDs are monotonically increasing in allocation order but this is an
///   implementation detail, not something callers should rely on for ordering.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The ID used for the implicit root fiber of a `run_*` call before any
    /// fiber has actually been allocated. Never returned by [`FiberId::next`].
    pub const fn root() -> Self {
        Self(0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
