// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-step error types.
//!
//! A step reports failure by returning an `anyhow::Error`. Inside the worker the
//! error is classified and stringified into a [`StepError`], which is the only
//! error representation that crosses the process boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An expected, already-diagnosed step failure.
///
/// Returning this from a step (directly or wrapped in `anyhow::Error`) reports
/// just the message, without a backtrace or cause chain.
///
/// # Example
/// ```
/// use parstep::errors::StepFailure;
///
/// fn check(free_space: u64) -> anyhow::Result<()> {
///     if free_space < 1024 {
///         return Err(StepFailure::new("not enough disk space").into());
///     }
///     Ok(())
/// }
///
/// assert!(check(10).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepFailure {
    message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a single step did not succeed, as reported by its worker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StepError {
    /// The step returned a [`StepFailure`]; carries its clean message.
    #[error("{0}")]
    Expected(String),

    /// Any other error or a panic; carries the full report with backtrace.
    #[error("{0}")]
    Unhandled(String),

    /// The worker was interrupted, terminated or died before reporting.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    /// Classify an error returned by a step.
    pub fn from_step_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<StepFailure>() {
            Some(failure) => StepError::Expected(failure.message().to_string()),
            None => StepError::Unhandled(format!("{:?}", error)),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Expected(message)
            | StepError::Unhandled(message)
            | StepError::Fatal(message) => message,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Fatal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Expected(_) => "expected",
            StepError::Unhandled(_) => "unhandled",
            StepError::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn step_failure_is_reported_verbatim() {
        let error: anyhow::Error = StepFailure::new("boom").into();
        assert_eq!(
            StepError::from_step_error(&error),
            StepError::Expected("boom".to_string())
        );
    }

    #[test]
    fn step_failure_behind_context_is_still_expected() {
        let error = Err::<(), _>(StepFailure::new("disk full"))
            .context("while copying artifacts")
            .unwrap_err();
        // Downcasting looks through context layers.
        assert_eq!(
            StepError::from_step_error(&error),
            StepError::Expected("disk full".to_string())
        );
    }

    #[test]
    fn other_errors_carry_the_cause_chain() {
        let error = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt"))
            .context("reading manifest")
            .unwrap_err();

        let reported = StepError::from_step_error(&error);
        assert_eq!(reported.kind(), "unhandled");
        assert!(reported.message().contains("reading manifest"));
        assert!(reported.message().contains("missing.txt"));
    }
}
