// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured concurrency combinators built on top of the core effect/fiber
//! primitives: racing, bounded/unbounded mapping, and the two FIFO-waiter
//! primitives (`Semaphore`, `Latch`).

mod for_each;
mod latch;
mod promise;
mod race;
mod semaphore;

pub use for_each::{for_each, Concurrency, ForEachOptions};
pub use latch::Latch;
pub use promise::Promise;
pub use race::{race, race_all, race_all_first, race_first, timeout, timeout_or_else};
pub use semaphore::Semaphore;
