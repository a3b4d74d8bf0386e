// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for the parallel region lifecycle.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use tracing::Span;

/// A parallel region started its workers.
///
/// # Log Level
/// `info!` - Important operational event
///
/// # Example
/// ```
/// use parstep::observability::messages::coordinator::ParallelStepsStarted;
///
/// let msg = ParallelStepsStarted {
///     step_count: 5,
///     max_parallel: Some(2),
/// };
///
/// assert_eq!(msg.to_string(), "Starting 5 parallel steps (max_parallel=2)");
/// ```
pub struct ParallelStepsStarted {
    pub step_count: usize,
    pub max_parallel: Option<usize>,
}

impl Display for ParallelStepsStarted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.max_parallel {
            Some(limit) => write!(
                f,
                "Starting {} parallel steps (max_parallel={})",
                self.step_count, limit
            ),
            None => write!(f, "Starting {} parallel steps (unbounded)", self.step_count),
        }
    }
}

impl StructuredLog for ParallelStepsStarted {
    fn log(&self) {
        tracing::info!(
            step_count = self.step_count,
            max_parallel = ?self.max_parallel,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "parallel_steps",
            span_name = name,
            step_count = self.step_count,
            max_parallel = ?self.max_parallel,
        )
    }
}

/// All workers of a parallel region were drained and joined.
///
/// # Log Level
/// `info!` on success, `error!` when any step failed
pub struct ParallelStepsCompleted {
    pub step_count: usize,
    pub failed: usize,
    pub duration: std::time::Duration,
}

impl Display for ParallelStepsCompleted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Parallel steps finished: {} steps, {} failed, in {:?}",
            self.step_count, self.failed, self.duration
        )
    }
}

impl StructuredLog for ParallelStepsCompleted {
    fn log(&self) {
        if self.failed == 0 {
            tracing::info!(
                step_count = self.step_count,
                duration_ms = self.duration.as_millis() as u64,
                "{}", self
            );
        } else {
            tracing::error!(
                step_count = self.step_count,
                failed = self.failed,
                duration_ms = self.duration.as_millis() as u64,
                "{}", self
            );
        }
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "parallel_steps_completed",
            span_name = name,
            step_count = self.step_count,
            failed = self.failed,
            duration = ?self.duration,
        )
    }
}

/// A step failed with halt-on-error set; remaining workers are terminated.
///
/// # Log Level
/// `warn!` - Degraded run, remaining output is squelched
pub struct HaltingOnError {
    pub worker: usize,
    pub remaining_workers: usize,
}

impl Display for HaltingOnError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker {} failed; halting {} remaining workers",
            self.worker, self.remaining_workers
        )
    }
}

impl StructuredLog for HaltingOnError {
    fn log(&self) {
        tracing::warn!(
            worker = self.worker,
            remaining_workers = self.remaining_workers,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "halting_on_error",
            span_name = name,
            worker = self.worker,
            remaining_workers = self.remaining_workers,
        )
    }
}
