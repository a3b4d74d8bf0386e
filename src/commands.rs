// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! External commands as parallel steps.
//!
//! The command inherits the worker's stdout/stderr, which the worker has
//! already pointed at the step's output channel, so its output is streamed
//! back exactly like output written by in-process steps.

use std::process::Command;
use std::time::Instant;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::CommandStepConfig;
use crate::engine::Step;
use crate::errors::StepFailure;

/// What a successful command step reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Build a step that runs `config`'s command and waits for it.
///
/// A command that cannot be spawned is an unhandled error; one that exits
/// non-zero or is killed by a signal is an expected [`StepFailure`].
pub fn command_step(config: &CommandStepConfig) -> Step<CommandRecord> {
    let config = config.clone();
    Step::named(config.name.clone(), move |registry| {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| StepFailure::new(format!("step '{}' has no command", config.name)))?;

        let mut command = Command::new(program);
        command.args(args).envs(&config.env);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let started = Instant::now();
        let status = command
            .status()
            .with_context(|| format!("failed to run '{}' for step '{}'", program, config.name))?;

        match status.code() {
            Some(0) => {
                registry.append(CommandRecord {
                    name: config.name.clone(),
                    exit_code: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(())
            }
            Some(code) => Err(StepFailure::new(format!(
                "step '{}': '{}' exited with status {}",
                config.name, program, code
            ))
            .into()),
            None => Err(StepFailure::new(format!(
                "step '{}': '{}' was terminated by a signal",
                config.name, program
            ))
            .into()),
        }
    })
}
