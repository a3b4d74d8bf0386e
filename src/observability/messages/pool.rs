// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for task pools.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use tracing::Span;

/// A task pool started its persistent workers.
///
/// # Log Level
/// `info!` - Important operational event
pub struct TaskPoolStarted {
    pub processes: usize,
}

impl Display for TaskPoolStarted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Task pool started with {} workers", self.processes)
    }
}

impl StructuredLog for TaskPoolStarted {
    fn log(&self) {
        tracing::info!(processes = self.processes, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("task_pool", span_name = name, processes = self.processes)
    }
}

/// Writing to the shared work queue failed; the pool is being torn down.
///
/// # Log Level
/// `error!` - Failure requiring attention
///
/// # Example
/// ```
/// use parstep::observability::messages::pool::TaskPoolFeedFailed;
///
/// let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no readers");
/// let msg = TaskPoolFeedFailed { queued: 7, error: &error };
/// assert_eq!(msg.to_string(), "Failed to enqueue work after 7 items: no readers");
/// ```
pub struct TaskPoolFeedFailed<'a> {
    pub queued: usize,
    pub error: &'a dyn std::error::Error,
}

impl Display for TaskPoolFeedFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Failed to enqueue work after {} items: {}",
            self.queued, self.error
        )
    }
}

impl StructuredLog for TaskPoolFeedFailed<'_> {
    fn log(&self) {
        tracing::error!(queued = self.queued, error = %self.error, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!("task_pool_feed_failed", span_name = name, queued = self.queued)
    }
}
