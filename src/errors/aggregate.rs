// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::fmt;

use crate::errors::StepError;

/// The single error returned when one or more background steps failed.
///
/// Holds every collected [`StepError`] in the order the workers were drained.
/// Failures are never deduplicated; its `Display` output is each message
/// concatenated, one block per failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFailure {
    errors: Vec<StepError>,
}

impl AggregateFailure {
    pub fn new(errors: Vec<StepError>) -> Self {
        Self { errors }
    }

    /// Wrap the collected errors, or `None` when nothing failed.
    pub fn from_errors(errors: Vec<StepError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self::new(errors))
        }
    }

    pub fn errors(&self) -> &[StepError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// True if any collected error came from an interrupted or dead worker.
    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(StepError::is_fatal)
    }

    pub fn into_errors(self) -> Vec<StepError> {
        self.errors
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let message = error.message();
            write!(f, "{}", message)?;
            if !message.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_errors_means_no_failure() {
        assert!(AggregateFailure::from_errors(vec![]).is_none());
    }

    #[test]
    fn display_concatenates_in_order_without_dedup() {
        let failure = AggregateFailure::new(vec![
            StepError::Expected("first".to_string()),
            StepError::Unhandled("second\n".to_string()),
            StepError::Expected("first".to_string()),
        ]);

        assert_eq!(failure.to_string(), "first\n\nsecond\n\nfirst\n");
        assert_eq!(failure.len(), 3);
        assert!(!failure.has_fatal());
    }
}
