// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! A worker: one forked OS process running an ordered queue of steps.
//!
//! # Lifecycle
//!
//! 1. `add()` queues steps, each with its own [`OutputChannel`].
//! 2. `start()` forks. The child runs every step in order, redirecting fd 1/2
//!    into the step's channel, and writes one newline-delimited JSON
//!    [`Outcome`] per step to its return pipe.
//! 3. `wait_for_step()` (parent) collects steps oldest first: it streams the
//!    channel into a sink at a fixed cadence until the step's outcome arrives,
//!    then drains the rest, deletes the channel and merges the results.
//! 4. `join()` reaps the child.
//!
//! # Failure containment
//!
//! Nothing a step does escapes the child: errors and panics become
//! [`StepError`] values, and a SIGINT/SIGTERM is turned into a `Fatal` outcome
//! by the handler in [`signals`](crate::engine::signals). If the child dies
//! without reporting (SIGKILL, abort), the parent reports the exit status as a
//! `Fatal` error and abandons the worker's remaining steps.
//!
//! # Concurrent starts
//!
//! Return pipes are created `O_CLOEXEC`, but a plain `fork` does not exec, so
//! any worker forked while another worker's pipe is open in the parent would
//! inherit its write end and hold off that worker's EOF. `start()` therefore
//! takes a process-wide lock from pipe creation until the parent has closed
//! its write end. Descriptors opened by code outside this crate are not
//! covered.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup, dup2, fork, pipe2, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::unix::pipe;

use crate::engine::output_channel::OutputChannel;
use crate::engine::registry::ResultsRegistry;
use crate::engine::semaphore::Semaphore;
use crate::engine::signals;
use crate::engine::step::{Outcome, Step};
use crate::errors::{ParallelError, StepError};
use crate::observability::messages::worker::*;
use crate::observability::messages::StructuredLog;

const EXIT_OK: i32 = 0;
const EXIT_SETUP_FAILED: i32 = 70;
const EXIT_REPORT_FAILED: i32 = 71;

static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);
static FORK_LOCK: Mutex<()> = Mutex::new(());

/// A step waiting to be collected by the parent.
#[derive(Debug)]
struct PendingStep {
    label: String,
    channel: Option<OutputChannel>,
}

struct QueuedStep<R> {
    step: Step<R>,
    label: String,
    channel: OutputChannel,
}

enum Frame {
    Pending,
    Line(String),
    Closed,
    Broken(io::Error),
}

pub struct Worker<R> {
    id: usize,
    semaphore: Option<Arc<Semaphore>>,
    poll_interval: Duration,
    queued: Vec<QueuedStep<R>>,
    uncollected: VecDeque<PendingStep>,
    started: bool,
    pid: Option<Pid>,
    return_fd: Option<OwnedFd>,
    returns: Option<Lines<BufReader<pipe::Receiver>>>,
    start_error: Option<StepError>,
    status: Option<WaitStatus>,
}

impl<R> Worker<R> {
    /// Create an idle worker. With a semaphore, the child holds one permit for
    /// its whole lifetime.
    pub fn new(id: usize, semaphore: Option<Arc<Semaphore>>, poll_interval: Duration) -> Self {
        Self {
            id,
            semaphore,
            poll_interval,
            queued: Vec::new(),
            uncollected: VecDeque::new(),
            started: false,
            pid: None,
            return_fd: None,
            returns: None,
            start_error: None,
            status: None,
        }
    }

    /// A worker that never runs and reports `error` for its single step.
    pub(crate) fn failed(id: usize, label: String, error: StepError) -> Self {
        let mut worker = Self::new(id, None, Duration::ZERO);
        worker.started = true;
        worker.start_error = Some(error);
        worker.uncollected.push_back(PendingStep {
            label,
            channel: None,
        });
        worker
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// Queue a step. Only valid before [`start`](Self::start).
    pub fn add(&mut self, step: Step<R>) -> Result<(), ParallelError> {
        if self.started {
            return Err(ParallelError::AlreadyStarted);
        }
        let channel = OutputChannel::create()?;
        let label = match step.name() {
            Some(name) => name.to_string(),
            None => format!("worker-{}/step-{}", self.id, self.queued.len()),
        };
        self.queued.push(QueuedStep {
            step,
            label,
            channel,
        });
        Ok(())
    }

    /// True when no step is left to collect.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.uncollected.is_empty()
    }

    /// Ask a running worker to stop. Its current step is reported as fatal.
    pub fn terminate(&self) {
        if let (Some(pid), None) = (self.pid, self.status) {
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                tracing::debug!(worker = self.id, error = %e, "failed to signal worker");
            }
        }
    }

    /// Fork the worker process and hand it every queued step.
    ///
    /// On failure no step runs; every queued step is still collected by
    /// `wait_for_step`, the first one reporting the start failure.
    pub fn start(&mut self) -> Result<(), ParallelError>
    where
        R: Serialize,
    {
        if self.started {
            return Err(ParallelError::AlreadyStarted);
        }
        self.started = true;
        let queued = std::mem::take(&mut self.queued);

        // Held until the parent has closed its copy of the write end, so no
        // other worker forked meanwhile inherits it and delays our EOF.
        let fork_guard = FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (read_end, write_end) = match pipe2(OFlag::O_CLOEXEC) {
            Ok(ends) => ends,
            Err(e) => {
                drop(fork_guard);
                return Err(self.fail_start(queued, e.into()));
            }
        };

        // Hold both stdio locks across the fork: the child then owns them
        // instead of inheriting a lock held by some other thread, and nothing
        // buffered gets written twice.
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        let _ = stdout.flush();
        let _ = stderr.flush();
        // SAFETY: the child only runs the queued steps and then calls `_exit`;
        // it never returns into the caller's stack or async runtime.
        let forked = unsafe { fork() };
        drop(stderr);
        drop(stdout);

        match forked {
            Err(e) => {
                drop(fork_guard);
                Err(self.fail_start(queued, e.into()))
            }
            Ok(ForkResult::Child) => {
                drop(fork_guard);
                drop(read_end);
                let code = run_child(queued, self.semaphore.as_deref(), write_end);
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_end);
                drop(fork_guard);
                WorkerStarted {
                    worker: self.id,
                    pid: child.as_raw(),
                    steps: queued.len(),
                }
                .log();
                self.pid = Some(child);
                self.return_fd = Some(read_end);
                self.uncollected
                    .extend(queued.into_iter().map(|queued| PendingStep {
                        label: queued.label,
                        channel: Some(queued.channel),
                    }));
                Ok(())
            }
        }
    }

    fn fail_start(&mut self, queued: Vec<QueuedStep<R>>, error: ParallelError) -> ParallelError {
        self.start_error = Some(StepError::Fatal(format!(
            "failed to start worker {}: {}",
            self.id, error
        )));
        self.uncollected
            .extend(queued.into_iter().map(|queued| PendingStep {
                label: queued.label,
                channel: Some(queued.channel),
            }));
        error
    }

    /// Collect the oldest uncollected step.
    ///
    /// Streams the step's output into `sink` (unless `silent`) every poll
    /// interval until the worker reports the step, then appends the step's
    /// results to `registry`. Returns the step's error, if any. Never fails:
    /// plumbing problems are reported as `Fatal` step errors.
    pub async fn wait_for_step(
        &mut self,
        sink: &mut (dyn Write + Send),
        silent: bool,
        registry: &mut ResultsRegistry<R>,
    ) -> Option<StepError>
    where
        R: DeserializeOwned,
    {
        let mut pending = self.uncollected.pop_front()?;

        if let Some(error) = self.start_error.take() {
            self.finish_channel(pending, &mut *sink, silent);
            self.abandon_remaining(&mut *sink, silent);
            return Some(error);
        }

        let started = Instant::now();
        let outcome = loop {
            match self.next_frame().await {
                Frame::Pending => self.drain(&mut pending, &mut *sink, silent),
                Frame::Line(line) => {
                    break serde_json::from_str::<Outcome<R>>(&line).unwrap_or_else(|e| {
                        Outcome::Failed(StepError::Fatal(format!(
                            "worker {} sent an unreadable result: {}",
                            self.id, e
                        )))
                    })
                }
                Frame::Closed => break Outcome::Failed(StepError::Fatal(self.describe_exit().await)),
                Frame::Broken(e) => {
                    break Outcome::Failed(StepError::Fatal(format!(
                        "lost contact with worker {}: {}",
                        self.id, e
                    )))
                }
            }
        };

        let label = pending.label.clone();
        self.finish_channel(pending, &mut *sink, silent);

        match outcome {
            Outcome::Ok(records) => {
                StepCompleted {
                    worker: self.id,
                    step: &label,
                    records: records.len(),
                    duration: started.elapsed(),
                }
                .log();
                registry.extend(records);
                None
            }
            Outcome::Failed(error) => {
                StepFailed {
                    worker: self.id,
                    step: &label,
                    kind: error.kind(),
                }
                .log();
                if error.is_fatal() {
                    self.abandon_remaining(&mut *sink, silent);
                }
                Some(error)
            }
        }
    }

    /// Reap the worker process. Safe to call more than once.
    pub async fn join(&mut self) -> Result<Option<WaitStatus>, ParallelError> {
        if self.pid.is_none() {
            return Ok(None);
        }
        // A child blocked on an unread frame gets EPIPE instead of hanging.
        self.returns = None;
        self.return_fd = None;
        self.reap().await.map(Some)
    }

    async fn next_frame(&mut self) -> Frame {
        if self.returns.is_none() {
            let Some(fd) = self.return_fd.take() else {
                return Frame::Closed;
            };
            match pipe::Receiver::from_owned_fd(fd) {
                Ok(receiver) => self.returns = Some(BufReader::new(receiver).lines()),
                Err(e) => return Frame::Broken(e),
            }
        }
        let Some(returns) = self.returns.as_mut() else {
            return Frame::Closed;
        };

        match tokio::time::timeout(self.poll_interval, returns.next_line()).await {
            Err(_) => Frame::Pending,
            Ok(Ok(Some(line))) => Frame::Line(line),
            Ok(Ok(None)) => Frame::Closed,
            Ok(Err(e)) => Frame::Broken(e),
        }
    }

    async fn reap(&mut self) -> Result<WaitStatus, ParallelError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let pid = self.pid.ok_or(ParallelError::NotStarted)?;
        let status = tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        self.status = Some(status);
        Ok(status)
    }

    async fn describe_exit(&mut self) -> String {
        let pid = self.pid().unwrap_or_default();
        match self.reap().await {
            Ok(WaitStatus::Exited(_, code)) => format!(
                "worker {} (pid {}) exited with status {} before reporting a result",
                self.id, pid, code
            ),
            Ok(WaitStatus::Signaled(_, signal, _)) => format!(
                "worker {} (pid {}) was killed by {:?} before reporting a result",
                self.id, pid, signal
            ),
            Ok(other) => format!(
                "worker {} (pid {}) stopped reporting ({:?})",
                self.id, pid, other
            ),
            Err(e) => format!(
                "worker {} (pid {}) stopped reporting and could not be reaped: {}",
                self.id, pid, e
            ),
        }
    }

    fn drain(&self, pending: &mut PendingStep, sink: &mut dyn Write, silent: bool) {
        if let Some(channel) = pending.channel.as_mut() {
            if let Err(e) = channel.drain_into(sink, silent) {
                OutputChannelFailed {
                    worker: self.id,
                    path: channel.path(),
                    error: &e,
                }
                .log();
            }
        }
    }

    /// Final read of a collected step's channel, then delete it.
    fn finish_channel(&self, mut pending: PendingStep, sink: &mut dyn Write, silent: bool) {
        self.drain(&mut pending, sink, silent);
        if let Some(channel) = pending.channel.take() {
            let path = channel.path().to_path_buf();
            if let Err(e) = channel.remove() {
                OutputChannelFailed {
                    worker: self.id,
                    path: &path,
                    error: &e,
                }
                .log();
            }
        }
    }

    fn abandon_remaining(&mut self, sink: &mut dyn Write, silent: bool) {
        while let Some(pending) = self.uncollected.pop_front() {
            StepAbandoned {
                worker: self.id,
                step: &pending.label,
            }
            .log();
            self.finish_channel(pending, &mut *sink, silent);
        }
    }
}

impl<R> std::fmt::Debug for Worker<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("queued", &self.queued.len())
            .field("uncollected", &self.uncollected)
            .field("status", &self.status)
            .finish()
    }
}

/// Format a caught panic, preferring the report captured by the child's hook.
pub(crate) fn panic_report(payload: Box<dyn Any + Send>) -> String {
    if let Some(report) = LAST_PANIC.lock().ok().and_then(|mut last| last.take()) {
        return report;
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("step panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("step panicked: {}", message)
    } else {
        "step panicked with a non-string payload".to_string()
    }
}

fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

// --- child side ---

fn run_child<R: Serialize>(
    queued: Vec<QueuedStep<R>>,
    semaphore: Option<&Semaphore>,
    returns: OwnedFd,
) -> i32 {
    let mut returns = File::from(returns);
    if let Err(e) = signals::install_fatal_handlers(returns.as_raw_fd()) {
        let _ = writeln!(io::stderr(), "parstep worker: cannot install signal handlers: {}", e);
    }
    install_panic_hook();

    let permit = match semaphore.map(|semaphore| semaphore.acquire()).transpose() {
        Ok(permit) => permit,
        Err(e) => {
            let reason = format!("failed to acquire a worker slot: {}", e);
            return abandon_in_child::<R>(queued, &mut returns, reason);
        }
    };
    let stdio = match SavedStdio::save() {
        Ok(stdio) => stdio,
        Err(e) => {
            let reason = format!("failed to save stdout/stderr: {}", e);
            return abandon_in_child::<R>(queued, &mut returns, reason);
        }
    };

    let mut registry = ResultsRegistry::new();
    let mut code = EXIT_OK;
    let mut steps = queued.into_iter();
    for QueuedStep { step, channel, .. } in steps.by_ref() {
        registry.clear();
        let outcome = match stdio.redirect_to(channel.write_fd()) {
            Ok(()) => run_step(step, &mut registry),
            Err(e) => Outcome::Failed(StepError::Fatal(format!(
                "failed to redirect step output: {}",
                e
            ))),
        };
        let restored = stdio.restore();
        channel.close_in_child();

        if send_outcome(&mut returns, &outcome).is_err() {
            code = EXIT_REPORT_FAILED;
            break;
        }
        if restored.is_err() {
            code = EXIT_SETUP_FAILED;
            break;
        }
    }
    // Unrun steps keep their files; the parent drains and deletes them.
    for QueuedStep { channel, .. } in steps {
        channel.close_in_child();
    }

    signals::disarm();
    drop(permit);
    code
}

fn abandon_in_child<R: Serialize>(
    queued: Vec<QueuedStep<R>>,
    returns: &mut File,
    reason: String,
) -> i32 {
    for QueuedStep { channel, .. } in queued {
        channel.close_in_child();
    }
    let _ = send_outcome::<R>(returns, &Outcome::Failed(StepError::Fatal(reason)));
    EXIT_SETUP_FAILED
}

fn run_step<R>(step: Step<R>, registry: &mut ResultsRegistry<R>) -> Outcome<R> {
    let body = step.into_body();
    match panic::catch_unwind(AssertUnwindSafe(|| body(registry))) {
        Ok(Ok(())) => Outcome::Ok(registry.take()),
        Ok(Err(error)) => Outcome::Failed(StepError::from_step_error(&error)),
        Err(payload) => Outcome::Failed(StepError::Unhandled(panic_report(payload))),
    }
}

fn send_outcome<R: Serialize>(returns: &mut File, outcome: &Outcome<R>) -> io::Result<()> {
    let mut frame = match serde_json::to_vec(outcome) {
        Ok(frame) => frame,
        Err(e) => serde_json::to_vec(&Outcome::<R>::Failed(StepError::Unhandled(format!(
            "failed to encode step results: {}",
            e
        ))))?,
    };
    frame.push(b'\n');
    returns.write_all(&frame)
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let report = format!("{}\n\nStack backtrace:\n{}", info, Backtrace::force_capture());
        if let Ok(mut last) = LAST_PANIC.lock() {
            *last = Some(report);
        }
    }));
}

/// The worker's real stdout/stderr, kept aside while steps are redirected.
struct SavedStdio {
    stdout: OwnedFd,
    stderr: OwnedFd,
}

impl SavedStdio {
    fn save() -> nix::Result<Self> {
        let stdout = dup(libc::STDOUT_FILENO)?;
        let stdout = unsafe { OwnedFd::from_raw_fd(stdout) };
        let stderr = dup(libc::STDERR_FILENO)?;
        let stderr = unsafe { OwnedFd::from_raw_fd(stderr) };
        Ok(Self { stdout, stderr })
    }

    fn redirect_to(&self, fd: RawFd) -> nix::Result<()> {
        flush_stdio();
        dup2(fd, libc::STDOUT_FILENO)?;
        dup2(fd, libc::STDERR_FILENO)?;
        Ok(())
    }

    fn restore(&self) -> nix::Result<()> {
        flush_stdio();
        dup2(self.stdout.as_raw_fd(), libc::STDOUT_FILENO)?;
        dup2(self.stderr.as_raw_fd(), libc::STDERR_FILENO)?;
        Ok(())
    }
}
