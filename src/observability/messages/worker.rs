// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for worker processes and the steps they run.
//!
//! These are emitted by the parent while it drains a worker; the worker's own
//! output goes to the step's output channel instead.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use std::path::Path;
use tracing::Span;

/// A worker process was forked.
///
/// # Log Level
/// `debug!` - One per worker, noisy for large runs
///
/// # Example
/// ```
/// use parstep::observability::messages::worker::WorkerStarted;
///
/// let msg = WorkerStarted { worker: 3, pid: 1234, steps: 2 };
/// assert_eq!(msg.to_string(), "Worker 3 started as pid 1234 with 2 steps");
/// ```
pub struct WorkerStarted {
    pub worker: usize,
    pub pid: i32,
    pub steps: usize,
}

impl Display for WorkerStarted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker {} started as pid {} with {} steps",
            self.worker, self.pid, self.steps
        )
    }
}

impl StructuredLog for WorkerStarted {
    fn log(&self) {
        tracing::debug!(worker = self.worker, pid = self.pid, steps = self.steps, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "worker",
            span_name = name,
            worker = self.worker,
            pid = self.pid,
            steps = self.steps,
        )
    }
}

/// A worker could not be started; its steps are reported as fatal failures.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct WorkerStartFailed<'a> {
    pub worker: usize,
    pub error: &'a dyn std::error::Error,
}

impl Display for WorkerStartFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Worker {} failed to start: {}", self.worker, self.error)
    }
}

impl StructuredLog for WorkerStartFailed<'_> {
    fn log(&self) {
        tracing::error!(worker = self.worker, error = %self.error, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!(
            "worker_start_failed",
            span_name = name,
            worker = self.worker,
            error = %self.error,
        )
    }
}

/// A step reported success.
///
/// # Log Level
/// `debug!` - Per-step detail
pub struct StepCompleted<'a> {
    pub worker: usize,
    pub step: &'a str,
    pub records: usize,
    pub duration: std::time::Duration,
}

impl Display for StepCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Step '{}' on worker {} completed with {} results after {:?}",
            self.step, self.worker, self.records, self.duration
        )
    }
}

impl StructuredLog for StepCompleted<'_> {
    fn log(&self) {
        tracing::debug!(
            worker = self.worker,
            step = self.step,
            records = self.records,
            duration_ms = self.duration.as_millis() as u64,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "step_completed",
            span_name = name,
            worker = self.worker,
            step = self.step,
        )
    }
}

/// A step reported a failure.
///
/// # Log Level
/// `warn!` - The failure itself is carried by the aggregate error
pub struct StepFailed<'a> {
    pub worker: usize,
    pub step: &'a str,
    pub kind: &'a str,
}

impl Display for StepFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Step '{}' on worker {} failed ({})",
            self.step, self.worker, self.kind
        )
    }
}

impl StructuredLog for StepFailed<'_> {
    fn log(&self) {
        tracing::warn!(worker = self.worker, step = self.step, kind = self.kind, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "step_failed",
            span_name = name,
            worker = self.worker,
            step = self.step,
            kind = self.kind,
        )
    }
}

/// A queued step never ran because its worker died first.
///
/// # Log Level
/// `warn!`
pub struct StepAbandoned<'a> {
    pub worker: usize,
    pub step: &'a str,
}

impl Display for StepAbandoned<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Step '{}' abandoned: worker {} stopped before running it",
            self.step, self.worker
        )
    }
}

impl StructuredLog for StepAbandoned<'_> {
    fn log(&self) {
        tracing::warn!(worker = self.worker, step = self.step, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "step_abandoned",
            span_name = name,
            worker = self.worker,
            step = self.step,
        )
    }
}

/// Reading or deleting a step's output channel failed.
///
/// # Log Level
/// `warn!` - Output may be incomplete or a spill file left behind
pub struct OutputChannelFailed<'a> {
    pub worker: usize,
    pub path: &'a Path,
    pub error: &'a dyn std::error::Error,
}

impl Display for OutputChannelFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Output channel {} of worker {}: {}",
            self.path.display(),
            self.worker,
            self.error
        )
    }
}

impl StructuredLog for OutputChannelFailed<'_> {
    fn log(&self) {
        tracing::warn!(
            worker = self.worker,
            path = %self.path.display(),
            error = %self.error,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "output_channel_failed",
            span_name = name,
            worker = self.worker,
            path = %self.path.display(),
        )
    }
}

/// Reaping a worker process failed.
///
/// # Log Level
/// `warn!`
pub struct WorkerJoinFailed<'a> {
    pub worker: usize,
    pub error: &'a dyn std::error::Error,
}

impl Display for WorkerJoinFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Failed to join worker {}: {}", self.worker, self.error)
    }
}

impl StructuredLog for WorkerJoinFailed<'_> {
    fn log(&self) {
        tracing::warn!(worker = self.worker, error = %self.error, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!("worker_join_failed", span_name = name, worker = self.worker)
    }
}
