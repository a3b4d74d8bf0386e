// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod coordinator;
pub mod output_channel;
pub mod registry;
pub mod semaphore;
pub(crate) mod signals;
pub mod step;
pub mod task_pool;
pub mod work_queue;
pub mod worker;


pub use coordinator::{run_steps, Coordinator, CoordinatorOptions, ParallelRegion};
pub use output_channel::OutputChannel;
pub use registry::ResultsRegistry;
pub use semaphore::{Permit, Semaphore};
pub use step::{Outcome, Step};
pub use task_pool::{default_processes, run_task_pool, RunningPool, TaskPool};
pub use work_queue::WorkQueue;
pub use worker::Worker;
