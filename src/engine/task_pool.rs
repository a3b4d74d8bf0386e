// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Persistent worker pool fed from a shared [`WorkQueue`].
//!
//! A pool of N is a coordinator region of N workers, each running a single
//! step that drains the queue: pop an input, apply the task, repeat until a
//! sentinel. The parent feeds inputs while the workers run, then sends one
//! sentinel per worker and drains them like any other parallel region.
//!
//! After a task fails, its worker stops applying the task but keeps popping
//! (and dropping) inputs until it reaches its sentinel, so the other workers
//! are never left waiting on a queue nobody reads.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::consts::DEFAULT_CONCURRENCY_FALLBACK;
use crate::engine::coordinator::{Coordinator, CoordinatorOptions, ParallelRegion};
use crate::engine::registry::ResultsRegistry;
use crate::engine::step::Step;
use crate::engine::work_queue::WorkQueue;
use crate::engine::worker::panic_report;
use crate::errors::{AggregateFailure, ParallelError, StepError};
use crate::observability::messages::pool::{TaskPoolFeedFailed, TaskPoolStarted};
use crate::observability::messages::StructuredLog;
use crate::traits::Task;

type ExitHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Pool size when the caller does not choose one: one worker per core, but
/// never more workers than inputs and never fewer than one.
pub fn default_processes(inputs: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_CONCURRENCY_FALLBACK);
    cores.min(inputs).max(1)
}

/// Builder for a task pool.
pub struct TaskPool<A, R> {
    task: Arc<dyn Task<A, R>>,
    processes: usize,
    on_exit: Option<ExitHook>,
    options: CoordinatorOptions,
    output: Option<Box<dyn Write + Send>>,
    queue: Option<WorkQueue<A>>,
}

impl<A, R> TaskPool<A, R>
where
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
{
    pub fn new<F>(task: F) -> Self
    where
        F: Fn(&mut ResultsRegistry<R>, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_task(task)
    }

    pub fn with_task<T>(task: T) -> Self
    where
        T: Task<A, R> + 'static,
    {
        Self {
            task: Arc::new(task),
            processes: default_processes(usize::MAX),
            on_exit: None,
            options: CoordinatorOptions::default(),
            output: None,
            queue: None,
        }
    }

    /// Number of worker processes; at least one.
    pub fn processes(mut self, processes: usize) -> Self {
        self.processes = processes.max(1);
        self
    }

    /// Run `hook` in each worker after it reaches its sentinel.
    ///
    /// The hook runs even when one of the worker's tasks failed. Its own error
    /// is reported only if the worker had no earlier failure.
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(hook));
        self
    }

    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Feed the pool from an existing queue instead of creating one.
    pub fn with_queue(mut self, queue: WorkQueue<A>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Fork the workers. They block on the queue until inputs arrive.
    pub fn start(self) -> Result<RunningPool<A, R>, ParallelError> {
        let queue = match self.queue {
            Some(queue) => queue,
            None => WorkQueue::new()?,
        };

        let steps = (0..self.processes)
            .map(|i| {
                Step::named(
                    format!("pool-worker-{}", i),
                    drain_queue(queue.clone(), Arc::clone(&self.task), self.on_exit.clone()),
                )
            })
            .collect();

        let mut coordinator = Coordinator::new(self.options);
        if let Some(output) = self.output {
            coordinator = coordinator.with_output(output);
        }

        TaskPoolStarted {
            processes: self.processes,
        }
        .log();
        let region = coordinator.start(steps)?;
        queue.close_reader();

        Ok(RunningPool {
            region,
            queue,
            workers: self.processes,
            queued: 0,
            feed_failed: false,
        })
    }
}

/// A started pool accepting inputs.
pub struct RunningPool<A, R> {
    region: ParallelRegion<R>,
    queue: WorkQueue<A>,
    workers: usize,
    queued: usize,
    feed_failed: bool,
}

impl<A, R> RunningPool<A, R>
where
    A: Serialize + 'static,
    R: DeserializeOwned,
{
    /// Enqueue one input, waiting (off the async runtime) while the queue's
    /// pipe is full.
    ///
    /// If the queue cannot be written the workers are terminated; `finish`
    /// still has to be called to collect them.
    pub async fn put(&mut self, item: &A) -> Result<(), ParallelError> {
        if let Err(e) = self.queue.put_async(item).await {
            self.abort(&e);
            return Err(e);
        }
        self.queued += 1;
        Ok(())
    }

    pub fn queue(&self) -> &WorkQueue<A> {
        &self.queue
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Send one sentinel per worker and wait for every worker to finish.
    pub async fn finish(mut self, registry: &mut ResultsRegistry<R>) -> Result<(), AggregateFailure> {
        if !self.feed_failed {
            for _ in 0..self.workers {
                if let Err(e) = self.queue.put_sentinel_async().await {
                    self.abort(&e);
                    break;
                }
            }
        }
        self.region.wait(registry).await
    }

    fn abort(&mut self, error: &ParallelError) {
        TaskPoolFeedFailed {
            queued: self.queued,
            error,
        }
        .log();
        self.feed_failed = true;
        self.region.terminate_all();
    }
}

/// The single step each pool worker runs.
fn drain_queue<A, R>(
    queue: WorkQueue<A>,
    task: Arc<dyn Task<A, R>>,
    on_exit: Option<ExitHook>,
) -> impl FnOnce(&mut ResultsRegistry<R>) -> anyhow::Result<()> + Send + 'static
where
    A: DeserializeOwned + 'static,
    R: 'static,
{
    move |registry: &mut ResultsRegistry<R>| {
        let mut failure: Option<anyhow::Error> = None;
        loop {
            let input = match queue.pop() {
                Ok(Some(input)) => input,
                Ok(None) => break,
                Err(e) => {
                    failure.get_or_insert_with(|| e.into());
                    break;
                }
            };
            if failure.is_some() {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| task.run(registry, input))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e),
                Err(payload) => failure = Some(anyhow::anyhow!(panic_report(payload))),
            }
        }

        if let Some(hook) = on_exit {
            if let Err(e) = hook() {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Apply `task` to every input using a pool of worker processes.
///
/// `processes` defaults to [`default_processes`]. `on_exit` runs once in each
/// worker before it exits. Records appended by the task are merged into
/// `registry` in worker order, not input order.
pub async fn run_task_pool<A, R, F>(
    task: F,
    inputs: Vec<A>,
    processes: Option<usize>,
    on_exit: Option<Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>>,
    registry: &mut ResultsRegistry<R>,
) -> Result<(), AggregateFailure>
where
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
    F: Fn(&mut ResultsRegistry<R>, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let processes = processes.unwrap_or_else(|| default_processes(inputs.len()));
    let mut pool = TaskPool::new(task).processes(processes);
    if let Some(hook) = on_exit {
        pool = pool.on_exit(hook);
    }

    let mut running = match pool.start() {
        Ok(running) => running,
        Err(e) => {
            return Err(AggregateFailure::new(vec![StepError::Fatal(format!(
                "failed to start task pool: {}",
                e
            ))]))
        }
    };
    for input in &inputs {
        if running.put(input).await.is_err() {
            break;
        }
    }
    running.finish(registry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepFailure;
    use std::time::Duration;

    fn fast() -> CoordinatorOptions {
        CoordinatorOptions {
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn default_processes_is_bounded_by_inputs() {
        assert_eq!(default_processes(0), 1);
        assert_eq!(default_processes(1), 1);
        assert!(default_processes(1_000) >= 1);
        assert!(default_processes(3) <= 3);
    }

    #[tokio::test]
    async fn running_pool_accepts_inputs_after_start() {
        let mut running = TaskPool::new(|registry: &mut ResultsRegistry<u64>, n: u64| {
            registry.append(n * n);
            Ok(())
        })
        .processes(3)
        .options(fast())
        .with_output(std::io::sink())
        .start()
        .unwrap();

        for n in 1..=10u64 {
            running.put(&n).await.unwrap();
        }
        assert_eq!(running.queued(), 10);

        let mut registry = ResultsRegistry::new();
        running.finish(&mut registry).await.unwrap();

        let mut squares = registry.into_records();
        squares.sort_unstable();
        assert_eq!(squares, (1..=10u64).map(|n| n * n).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_task_keeps_draining_and_reports_once_per_worker() {
        let running = TaskPool::new(|_: &mut ResultsRegistry<()>, n: u32| {
            if n == 3 {
                return Err(StepFailure::new("three is not allowed").into());
            }
            Ok(())
        })
        .processes(1)
        .options(fast())
        .with_output(std::io::sink());

        let mut running = running.start().unwrap();
        for n in 0..6u32 {
            running.put(&n).await.unwrap();
        }
        let mut registry = ResultsRegistry::new();
        let failure = running.finish(&mut registry).await.unwrap_err();
        assert_eq!(
            failure.errors(),
            &[StepError::Expected("three is not allowed".to_string())]
        );
    }

    #[tokio::test]
    async fn panicking_task_is_unhandled() {
        let mut registry = ResultsRegistry::<()>::new();
        let running = TaskPool::new(|_: &mut ResultsRegistry<()>, _: u8| -> anyhow::Result<()> {
            panic!("task exploded")
        })
        .processes(1)
        .options(fast())
        .with_output(std::io::sink());

        let mut running = running.start().unwrap();
        running.put(&1).await.unwrap();
        let failure = running.finish(&mut registry).await.unwrap_err();

        assert_eq!(failure.len(), 1);
        let error = &failure.errors()[0];
        assert_eq!(error.kind(), "unhandled");
        assert!(error.message().contains("task exploded"));
    }
}
