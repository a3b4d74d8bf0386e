// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod aggregate;
mod config;
mod parallel;
mod step;

pub use aggregate::AggregateFailure;
pub use config::ConfigError;
pub use parallel::ParallelError;
pub use step::{StepError, StepFailure};
