// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Parallel step coordinator.
//!
//! Runs every step in its own worker process, all started at once (or as many
//! as the `max_parallel` semaphore lets through), then drains the workers in
//! submission order. Worker 1's output is fully written before worker 2's
//! starts, even if worker 2 finished first, so logs are deterministic. All step
//! failures come back as one [`AggregateFailure`].
//!
//! # Example
//! ```no_run
//! use parstep::engine::{Coordinator, CoordinatorOptions, ResultsRegistry, Step};
//!
//! # async fn demo() -> Result<(), parstep::errors::AggregateFailure> {
//! let steps = vec![
//!     Step::named("lint", |registry| {
//!         println!("linting");
//!         registry.append("lint ok".to_string());
//!         Ok(())
//!     }),
//!     Step::named("test", |registry| {
//!         println!("testing");
//!         registry.append("tests ok".to_string());
//!         Ok(())
//!     }),
//! ];
//!
//! let mut registry = ResultsRegistry::new();
//! let options = CoordinatorOptions { max_parallel: Some(2), ..Default::default() };
//! Coordinator::new(options).run(steps, &mut registry).await?;
//! assert_eq!(registry.records(), &["lint ok", "tests ok"]);
//! # Ok(())
//! # }
//! ```

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::consts::DEFAULT_POLL_INTERVAL;
use crate::engine::registry::ResultsRegistry;
use crate::engine::semaphore::Semaphore;
use crate::engine::step::Step;
use crate::engine::worker::Worker;
use crate::errors::{AggregateFailure, ParallelError, StepError};
use crate::observability::messages::coordinator::*;
use crate::observability::messages::worker::{WorkerJoinFailed, WorkerStartFailed};
use crate::observability::messages::StructuredLog;

/// How a parallel region runs and reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Upper bound on simultaneously running workers; `None` is unbounded.
    pub max_parallel: Option<usize>,
    /// Once any step has failed, stop printing output of later steps.
    pub hide_output_after_errors: bool,
    /// After the first failure, terminate the remaining workers, squelch their
    /// output and report only that first failure.
    pub halt_on_error: bool,
    /// How often a step's output is streamed while waiting for it.
    pub poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_parallel: None,
            hide_output_after_errors: false,
            halt_on_error: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Starts parallel regions.
pub struct Coordinator {
    options: CoordinatorOptions,
    output: Box<dyn Write + Send>,
}

impl Coordinator {
    /// A coordinator that streams step output to this process's stdout.
    pub fn new(options: CoordinatorOptions) -> Self {
        Self {
            options,
            output: Box::new(io::stdout()),
        }
    }

    /// Stream step output somewhere other than stdout.
    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Start one worker per step and return immediately.
    ///
    /// The caller may do other work while the steps run, then must call
    /// [`ParallelRegion::wait`]. A worker that cannot be started does not stop
    /// the others; it is reported as a fatal failure of its step.
    pub fn start<R>(self, steps: Vec<Step<R>>) -> Result<ParallelRegion<R>, ParallelError>
    where
        R: Serialize,
    {
        let semaphore = match self.options.max_parallel {
            Some(limit) => Some(Arc::new(Semaphore::new(limit)?)),
            None => None,
        };

        let step_count = steps.len();
        let start_msg = ParallelStepsStarted {
            step_count,
            max_parallel: self.options.max_parallel,
        };
        let span = start_msg.span("coordinator_start");
        let _guard = span.enter();
        start_msg.log();

        let workers = steps
            .into_iter()
            .enumerate()
            .map(|(id, step)| self.launch(id, step, semaphore.clone()))
            .collect();

        Ok(ParallelRegion {
            workers,
            output: self.output,
            options: self.options,
            started: Instant::now(),
        })
    }

    /// Run `steps` to completion, merging their results into `registry` in
    /// submission order.
    ///
    /// Results of steps that succeeded are merged even when others failed.
    pub async fn run<R>(
        self,
        steps: Vec<Step<R>>,
        registry: &mut ResultsRegistry<R>,
    ) -> Result<(), AggregateFailure>
    where
        R: Serialize + DeserializeOwned,
    {
        match self.start(steps) {
            Ok(region) => region.wait(registry).await,
            Err(e) => Err(AggregateFailure::new(vec![StepError::Fatal(format!(
                "failed to start parallel steps: {}",
                e
            ))])),
        }
    }

    fn launch<R>(&self, id: usize, step: Step<R>, semaphore: Option<Arc<Semaphore>>) -> Worker<R>
    where
        R: Serialize,
    {
        let label = step
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("step-{}", id));
        let mut worker = Worker::new(id, semaphore, self.options.poll_interval);

        if let Err(e) = worker.add(step) {
            WorkerStartFailed { worker: id, error: &e }.log();
            return unprepared(id, label, &e);
        }
        if let Err(e) = worker.start() {
            // The worker keeps its step and reports the failure when drained.
            WorkerStartFailed { worker: id, error: &e }.log();
        }
        worker
    }
}

/// Placeholder for a step whose worker could not even be prepared.
fn unprepared<R>(id: usize, label: String, error: &ParallelError) -> Worker<R> {
    let message = format!("failed to prepare step '{}': {}", label, error);
    Worker::failed(id, label, StepError::Fatal(message))
}

/// Workers that have been started and not yet drained.
///
/// Dropping a region without calling [`wait`](Self::wait) leaves its worker
/// processes unreaped.
pub struct ParallelRegion<R> {
    workers: Vec<Worker<R>>,
    output: Box<dyn Write + Send>,
    options: CoordinatorOptions,
    started: Instant,
}

impl<R> ParallelRegion<R> {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Send SIGTERM to every worker that has not been joined yet.
    pub fn terminate_all(&self) {
        for worker in &self.workers {
            worker.terminate();
        }
    }

    /// Drain every worker in submission order, join it, and report.
    ///
    /// Returns `Ok(())` only if every step succeeded. Otherwise returns one
    /// [`AggregateFailure`] holding every collected error in drain order (or
    /// just the first one with `halt_on_error`).
    pub async fn wait(mut self, registry: &mut ResultsRegistry<R>) -> Result<(), AggregateFailure>
    where
        R: DeserializeOwned,
    {
        let mut errors: Vec<StepError> = Vec::new();
        let mut halted = false;

        for index in 0..self.workers.len() {
            loop {
                let worker = &mut self.workers[index];
                if worker.is_empty() {
                    break;
                }
                let silent = halted || (self.options.hide_output_after_errors && !errors.is_empty());
                let Some(error) = worker.wait_for_step(&mut *self.output, silent, registry).await else {
                    continue;
                };
                if halted {
                    continue;
                }
                errors.push(error);

                if self.options.halt_on_error {
                    halted = true;
                    HaltingOnError {
                        worker: index,
                        remaining_workers: self.workers.len() - index - 1,
                    }
                    .log();
                    for worker in &self.workers[index + 1..] {
                        worker.terminate();
                    }
                }
            }

            let worker = &mut self.workers[index];
            if let Err(e) = worker.join().await {
                WorkerJoinFailed {
                    worker: worker.id(),
                    error: &e,
                }
                .log();
            }
        }

        let _ = self.output.flush();

        ParallelStepsCompleted {
            step_count: self.workers.len(),
            failed: errors.len(),
            duration: self.started.elapsed(),
        }
        .log();

        match AggregateFailure::from_errors(errors) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Run independent steps in parallel worker processes.
///
/// `max_parallel` bounds how many run at once (unbounded when `None`). With
/// `hide_output_after_errors`, output of steps collected after the first
/// failure is not printed. Results are appended to `registry` in submission
/// order.
pub async fn run_steps<R>(
    steps: Vec<Step<R>>,
    max_parallel: Option<usize>,
    hide_output_after_errors: bool,
    registry: &mut ResultsRegistry<R>,
) -> Result<(), AggregateFailure>
where
    R: Serialize + DeserializeOwned,
{
    let options = CoordinatorOptions {
        max_parallel,
        hide_output_after_errors,
        ..Default::default()
    };
    Coordinator::new(options).run(steps, registry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepFailure;
    use std::sync::Mutex;

    /// A `Write` sink the test can read back after handing it to a coordinator.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast() -> CoordinatorOptions {
        CoordinatorOptions {
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn say(text: &'static str) -> Step<String> {
        Step::new(move |registry| {
            io::stdout().write_all(text.as_bytes())?;
            registry.append(text.to_string());
            Ok(())
        })
    }

    #[tokio::test]
    async fn empty_step_list_succeeds() {
        let mut registry: ResultsRegistry<String> = ResultsRegistry::new();
        Coordinator::new(fast())
            .with_output(io::sink())
            .run(vec![], &mut registry)
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn hide_output_after_errors_silences_later_steps() {
        let buffer = SharedBuffer::default();
        let options = CoordinatorOptions {
            hide_output_after_errors: true,
            ..fast()
        };
        let steps = vec![
            say("before "),
            Step::new(|_| {
                io::stdout().write_all(b"failing ")?;
                Err(StepFailure::new("nope").into())
            }),
            say("after"),
        ];

        let mut registry = ResultsRegistry::new();
        let failure = Coordinator::new(options)
            .with_output(buffer.clone())
            .run(steps, &mut registry)
            .await
            .unwrap_err();

        // The failing step's own output is still shown; only later ones are hidden.
        assert_eq!(buffer.contents(), "before failing ");
        assert_eq!(failure.errors(), &[StepError::Expected("nope".to_string())]);
        assert_eq!(registry.records(), &["before ", "after"]);
    }

    #[tokio::test]
    async fn halt_on_error_reports_only_the_first_failure() {
        let buffer = SharedBuffer::default();
        let options = CoordinatorOptions {
            halt_on_error: true,
            ..fast()
        };
        let steps: Vec<Step<String>> = vec![
            Step::new(|_| Err(StepFailure::new("first failure").into())),
            Step::new(|_| {
                std::thread::sleep(Duration::from_secs(30));
                Ok(())
            }),
            Step::new(|_| Err(StepFailure::new("second failure").into())),
        ];

        let started = Instant::now();
        let mut registry = ResultsRegistry::new();
        let failure = Coordinator::new(options)
            .with_output(buffer)
            .run(steps, &mut registry)
            .await
            .unwrap_err();

        assert_eq!(
            failure.errors(),
            &[StepError::Expected("first failure".to_string())]
        );
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn unprepared_step_is_reported_as_fatal() {
        let error = ParallelError::Io(io::Error::new(io::ErrorKind::Other, "disk full"));
        let mut worker: Worker<String> = unprepared(3, "lint".to_string(), &error);

        let mut registry = ResultsRegistry::new();
        let reported = worker.wait_for_step(&mut io::sink(), false, &mut registry).await;
        assert_eq!(
            reported,
            Some(StepError::Fatal(
                "failed to prepare step 'lint': I/O error: disk full".to_string()
            ))
        );
        assert!(worker.is_empty());
    }

    #[tokio::test]
    async fn halted_workers_waiting_for_a_slot_are_released() {
        let options = CoordinatorOptions {
            max_parallel: Some(1),
            halt_on_error: true,
            ..fast()
        };
        let sleeper = || {
            Step::new(|_: &mut ResultsRegistry<String>| {
                std::thread::sleep(Duration::from_secs(30));
                Ok(())
            })
        };
        let steps = vec![
            Step::new(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Err(StepFailure::new("only failure").into())
            }),
            sleeper(),
            sleeper(),
        ];

        let started = Instant::now();
        let mut registry = ResultsRegistry::new();
        let failure = Coordinator::new(options)
            .with_output(io::sink())
            .run(steps, &mut registry)
            .await
            .unwrap_err();

        assert_eq!(
            failure.errors(),
            &[StepError::Expected("only failure".to_string())]
        );
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn start_returns_before_steps_finish() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let marker_in_step = marker.clone();

        let steps: Vec<Step<u8>> = vec![Step::new(move |_| {
            std::thread::sleep(Duration::from_millis(300));
            std::fs::write(&marker_in_step, b"x")?;
            Ok(())
        })];
        let region = Coordinator::new(fast())
            .with_output(io::sink())
            .start(steps)
            .unwrap();
        assert_eq!(region.worker_count(), 1);
        assert!(!marker.exists());

        let mut registry = ResultsRegistry::new();
        region.wait(&mut registry).await.unwrap();
        assert!(marker.exists());
    }
}
