//! Task sizing heuristics.
//!
//! Pure functions that turn a collection size and a caller-chosen batch size into
//! the number of tasks to submit and the number of threads those tasks need. None
//! of these functions validate their inputs: a zero batch size is a contract
//! violation, but every divisor is clamped to at least one so the worst outcome is
//! an oddly sized plan rather than a panic.

use crate::source::BatchIterable;

/// Inputs smaller than this run serially when no other threshold is given.
pub const DEFAULT_MIN_FORK_SIZE: usize = 10_000;

/// Default number of elements per batch for the [`parallel`](crate::parallel) facade.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Tasks submitted per pool thread when no size information is available.
pub const TASK_RATIO: usize = 2;

/// Upper bound on the size of the default pool.
pub const MAX_POOL_SIZE: usize = 100;

/// Logical CPUs visible to this process.
pub fn available_processors() -> usize {
    num_cpus::get().max(1)
}

/// Size of the default worker pool: one more than the CPU count, capped at [`MAX_POOL_SIZE`].
pub fn default_max_pool_size() -> usize {
    (available_processors() + 1).min(MAX_POOL_SIZE)
}

/// Task count used when the caller supplies neither a batch size nor a task count.
pub fn default_task_count() -> usize {
    default_max_pool_size() * TASK_RATIO
}

/// `max(2, size / batch_size)`.
pub fn task_count(size: usize, batch_size: usize) -> usize {
    (size / batch_size.max(1)).max(2)
}

/// Task count for sources that chunk themselves.
///
/// Asks the source how many batches it would cut for a target batch size of
/// `ceil(size / task_count)`, and never goes below two.
pub fn batched_task_count<T, S>(source: &S, task_count: usize) -> usize
where
    S: BatchIterable<T> + ?Sized,
{
    let target = source.size().div_ceil(task_count.max(1));
    source.batch_count(target.max(1)).max(2)
}

/// `min(size, task_count)`.
pub fn thread_count(size: usize, task_count: usize) -> usize {
    size.min(task_count)
}

/// A resolved sizing plan for one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskSizing {
    pub batch_size: usize,
    pub task_count: usize,
    pub thread_count: usize,
}

impl TaskSizing {
    /// Plan for `size` elements cut into batches of roughly `batch_size`.
    pub fn for_size(size: usize, batch_size: usize) -> Self {
        let tasks = task_count(size, batch_size);
        Self {
            batch_size,
            task_count: tasks,
            thread_count: thread_count(size, tasks),
        }
    }

    /// Plan for `size` elements with an explicit task count.
    pub fn with_task_count(size: usize, task_count: usize) -> Self {
        Self {
            batch_size: size.div_ceil(task_count.max(1)),
            task_count,
            thread_count: thread_count(size, task_count),
        }
    }
}
