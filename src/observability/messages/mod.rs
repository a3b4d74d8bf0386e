// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging.
//!
//! * `coordinator` - parallel region start, completion and halting
//! * `worker` - worker start, step completion, failures and cleanup
//! * `pool` - task pool lifecycle

use std::fmt::Display;
use tracing::Span;

pub mod coordinator;
pub mod pool;
pub mod worker;

/// A log message that knows its own level and structured fields.
pub trait StructuredLog: Display {
    /// Emit the message as a `tracing` event at its level.
    fn log(&self);

    /// Open a span carrying the message's fields.
    fn span(&self, name: &str) -> Span;
}
