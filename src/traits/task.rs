// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::engine::ResultsRegistry;

/// Work applied to each input of a task pool.
///
/// A task runs inside a pool worker process, once per input it dequeues. It
/// reports records by appending them to `registry`; returning an error (or
/// panicking) fails the pool. Wrap the error in
/// [`StepFailure`](crate::errors::StepFailure) to have it reported without a
/// backtrace.
///
/// Any `Fn(&mut ResultsRegistry<R>, A) -> anyhow::Result<()>` closure is a task.
pub trait Task<A, R>: Send + Sync {
    fn run(&self, registry: &mut ResultsRegistry<R>, input: A) -> anyhow::Result<()>;
}

impl<A, R, F> Task<A, R> for F
where
    F: Fn(&mut ResultsRegistry<R>, A) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, registry: &mut ResultsRegistry<R>, input: A) -> anyhow::Result<()> {
        self(registry, input)
    }
}
