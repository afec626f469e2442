//! Facade configuration.
//!
//! There is no configuration file or environment surface; [`ParallelConfig`] is a plain
//! value with defaults taken from [`sizing`](crate::sizing). It derives `serde` so
//! applications can embed it in their own configuration, with every field optional.

use serde::{Deserialize, Serialize};

use crate::sizing::DEFAULT_BATCH_SIZE;

/// How the [`Parallel`](crate::parallel::Parallel) facade sizes its runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Target elements per batch.
    pub batch_size: usize,
    /// Inputs smaller than this run serially. Defaults to `batch_size`.
    pub min_fork_size: Option<usize>,
    /// Pin the task count instead of deriving it from `batch_size`.
    pub task_count: Option<usize>,
    /// Let order-sensitive operations assemble results in completion order.
    pub allow_reordered: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            min_fork_size: None,
            task_count: None,
            allow_reordered: false,
        }
    }
}

impl ParallelConfig {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_min_fork_size(mut self, min_fork_size: usize) -> Self {
        self.min_fork_size = Some(min_fork_size);
        self
    }

    #[must_use]
    pub fn with_task_count(mut self, task_count: usize) -> Self {
        self.task_count = Some(task_count);
        self
    }

    #[must_use]
    pub fn with_allow_reordered(mut self, allow_reordered: bool) -> Self {
        self.allow_reordered = allow_reordered;
        self
    }

    /// The serial threshold actually used.
    pub fn effective_min_fork_size(&self) -> usize {
        self.min_fork_size.unwrap_or(self.batch_size)
    }
}
