// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::engine::registry::ResultsRegistry;
use crate::errors::StepError;

type StepBody<R> = Box<dyn FnOnce(&mut ResultsRegistry<R>) -> anyhow::Result<()> + Send>;

/// A unit of background work.
///
/// The body takes no arguments besides the registry it reports results into.
/// Bodies run inside a forked worker process and must be synchronous: they
/// cannot use the parent's async runtime.
///
/// # Example
/// ```
/// use parstep::engine::Step;
///
/// let step = Step::named("count", |registry| {
///     registry.append(42u32);
///     Ok(())
/// });
/// assert_eq!(step.name(), Some("count"));
/// ```
pub struct Step<R> {
    name: Option<String>,
    body: StepBody<R>,
}

impl<R> Step<R> {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&mut ResultsRegistry<R>) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: None,
            body: Box::new(body),
        }
    }

    pub fn named<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&mut ResultsRegistry<R>) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: Some(name.into()),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn into_body(self) -> StepBody<R> {
        self.body
    }
}

impl<R> std::fmt::Debug for Step<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// What a worker reports for one step; the only data crossing the process
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome<R> {
    Ok(Vec<R>),
    Failed(StepError),
}

impl<R> Outcome<R> {
    pub fn into_result(self) -> Result<Vec<R>, StepError> {
        match self {
            Outcome::Ok(records) => Ok(records),
            Outcome::Failed(error) => Err(error),
        }
    }
}
