//! # Ironbatch
//!
//! A **parallel batch-iteration engine**: split a collection into batches, run one
//! independent procedure per batch on a worker pool, then fold the finished
//! procedures into a single result with a combiner.
//!
//! ## Key Features
//!
//! - **Three source shapes** - random-access collections split into contiguous ranges,
//!   self-chunking [`BatchIterable`] sources split into sections, and plain iterators
//!   materialised once
//! - **Caller-runs worker pool** - a saturated [`WorkerPool`] runs work on the submitting
//!   thread instead of queueing it
//! - **Per-task state** - a [`ProcedureFactory`] hands every task its own procedure, so
//!   tasks never share mutable state unless asked to
//! - **Order-preserving combination** - combiners either fold results as tasks complete
//!   or receive every result at once in batch order
//! - **Compensated floating-point sums** - grouped sums keep their low-order bits across
//!   batches
//!
//! ## Quick Start
//!
//! ```
//! use ironbatch::{Parallel, ParallelConfig, BatchRunner};
//!
//! # fn main() -> anyhow::Result<()> {
//! let par = Parallel::new(BatchRunner::default(), ParallelConfig::default().with_batch_size(1_000));
//! let words: Vec<String> = ["apple", "avocado", "banana", "blueberry", "cherry"]
//!     .iter()
//!     .map(ToString::to_string)
//!     .collect();
//!
//! let long = par.select(words.clone(), |w: &String| w.len() > 6)?;
//! assert_eq!(long, vec!["avocado".to_string(), "blueberry".to_string()]);
//!
//! let by_letter = par.group_by(words, |w: &String| w.chars().next())?;
//! assert_eq!(by_letter[&Some('b')].len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Runner
//!
//! [`BatchRunner::run`] takes a [`BatchSource`], a factory, a combiner, a serial
//! threshold and a task count. Sources smaller than the threshold, and runs started
//! from inside another run's task, execute on the calling thread with one procedure.
//!
//! ### Procedures and combiners
//!
//! A [`Procedure`] consumes the elements of one batch. A [`Combiner`] receives finished
//! procedures, either one at a time in completion order
//! ([`combine_one`](Combiner::combine_one)) or all together in batch order
//! ([`combine_all`](Combiner::combine_all)).
//!
//! ### Failure
//!
//! A panic inside a procedure fails the whole run with [`BatchError::TaskFailed`]
//! after every submitted task has finished. There are no partial results.

pub mod combiners;
pub mod config;
pub mod error;
pub mod metrics;
pub mod parallel;
pub mod pool;
pub mod procedure;
pub mod runner;
pub mod sizing;
pub mod source;

// General re-exports
pub use combiners::{AverageF64, CombineFn, Combiner, CompensatedSum, Count, Max, Min, Sum};
pub use config::ParallelConfig;
pub use error::{BatchError, BatchResult};
pub use metrics::MetricsCollector;
pub use parallel::Parallel;
pub use pool::{Executor, InlineExecutor, WorkerPool, default_pool, shutdown_default_pool};
pub use procedure::{IndexedProcedure, PassThruFactory, Procedure, ProcedureFactory, Synchronized};
pub use runner::{BatchRunner, Plan};
pub use source::{Batch, BatchIterable, BatchSource, Buckets, RandomAccess, ResolvedSource};
