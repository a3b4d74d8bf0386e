// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod commands;      // external commands as steps
pub mod config;        // runner config
pub mod engine;        // workers, coordinator, task pool
pub mod errors;        // error handling
pub mod observability;
pub mod traits;        // task abstraction

pub use engine::{run_steps, run_task_pool, ResultsRegistry, Step};
pub use errors::{AggregateFailure, StepError, StepFailure};
