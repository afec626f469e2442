//! The batch runner: split, dispatch, await, combine.
//!
//! A run moves through `Idle → Splitting → Dispatched → Awaiting → Combining → Done`,
//! or stops in `Failed` as soon as the barrier has seen every task and one of them
//! panicked. There are no retries and no partial results.
//!
//! ```
//! use ironbatch::combiners::{CountCombiner, CountProcedure};
//! use ironbatch::pool::InlineExecutor;
//! use ironbatch::runner::BatchRunner;
//! use std::sync::Arc;
//!
//! let runner = BatchRunner::new(Arc::new(InlineExecutor));
//! let evens = || CountProcedure::new(|x: &u32| x % 2 == 0);
//! let mut count = CountCombiner::new();
//! runner.run((1..=100u32).collect::<Vec<_>>().into(), &evens, &mut count, 10, 4)?;
//! assert_eq!(count.count(), 50);
//! # Ok::<(), ironbatch::BatchError>(())
//! ```

use crossbeam::channel;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::combiners::Combiner;
use crate::error::{panic_message, BatchError, BatchResult};
use crate::metrics::MetricsCollector;
use crate::pool::{default_pool, Executor, InlineExecutor};
use crate::procedure::{IndexedProcedure, Procedure, ProcedureFactory};
use crate::sizing::thread_count;
use crate::source::{sections, split_ranges, Batch, BatchSource, RandomAccess, ResolvedSource};

thread_local! {
    static IN_BATCH_TASK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is executing a task of some run.
///
/// Runs started from inside a task execute serially: a task blocking on the pool it
/// is running on could otherwise starve it.
pub fn inside_batch_task() -> bool {
    IN_BATCH_TASK.with(Cell::get)
}

/// Marks the current thread as running a task until dropped.
struct TaskScope {
    previous: bool,
}

impl TaskScope {
    fn enter() -> Self {
        Self {
            previous: IN_BATCH_TASK.replace(true),
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        IN_BATCH_TASK.set(self.previous);
    }
}

/// How a run will execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Nothing to do; the factory and combiner are never touched.
    Empty,
    /// One procedure over the whole source on the calling thread.
    Serial(Batch),
    /// One task per batch on the executor.
    Parallel(Vec<Batch>),
}

impl Plan {
    /// Decide how to run `source`.
    ///
    /// Batch-iterable sources get `min(size, task_count, source.batch_count(ceil(size /
    /// task_count)))` sections, clamped to at least one; random-access sources get
    /// `min(size, task_count)` contiguous ranges.
    pub fn for_source<T>(source: &ResolvedSource<T>, min_fork_size: usize, task_count: usize) -> Self {
        let size = source.size();
        if size == 0 {
            return Plan::Empty;
        }
        if size < min_fork_size {
            return Plan::Serial(whole(source));
        }
        let task_count = task_count.max(1);
        match source {
            ResolvedSource::Batched(s) => {
                let target = size.div_ceil(task_count);
                let n = thread_count(size, task_count).min(s.batch_count(target)).max(1);
                Plan::Parallel(sections(n))
            }
            ResolvedSource::RandomAccess(_) => {
                Plan::Parallel(split_ranges(size, thread_count(size, task_count)))
            }
        }
    }

    /// Number of procedures the combiner will receive.
    pub fn task_count(&self) -> usize {
        match self {
            Plan::Empty => 0,
            Plan::Serial(_) => 1,
            Plan::Parallel(batches) => batches.len(),
        }
    }
}

fn whole<T>(source: &ResolvedSource<T>) -> Batch {
    match source {
        ResolvedSource::RandomAccess(s) => Batch::Range {
            index: 0,
            start: 0,
            end: s.len(),
        },
        ResolvedSource::Batched(_) => Batch::Section { index: 0, count: 1 },
    }
}

struct TaskReport<P> {
    batch: usize,
    outcome: Result<P, String>,
}

/// Drives procedures over batches of a source on an [`Executor`].
///
/// The executor is injected and may be shared by any number of runners and
/// concurrent runs. `BatchRunner::default()` uses the process-wide [`default_pool`].
#[derive(Clone)]
pub struct BatchRunner {
    executor: Arc<dyn Executor>,
    metrics: Option<MetricsCollector>,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new(default_pool())
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            metrics: None,
        }
    }

    /// A runner whose tasks all execute on the calling thread.
    pub fn inline() -> Self {
        Self::new(Arc::new(InlineExecutor))
    }

    /// Same runner, different executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Record run counters into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }

    /// Run one procedure per batch of `source` and combine the results.
    ///
    /// - empty source: returns immediately.
    /// - fewer than `min_fork_size` elements, or called from inside another run's task:
    ///   a single procedure runs on the calling thread.
    /// - otherwise up to `task_count` tasks are submitted and the caller blocks until
    ///   every one of them has reported.
    ///
    /// # Errors
    ///
    /// [`BatchError::TaskFailed`] carrying the first task panic observed, or
    /// [`BatchError::Disconnected`] if the executor dropped a job.
    pub fn run<T, F, C>(
        &self,
        source: BatchSource<T>,
        factory: &F,
        combiner: &mut C,
        min_fork_size: usize,
        task_count: usize,
    ) -> BatchResult<()>
    where
        T: Send + Sync + 'static,
        F: ProcedureFactory + ?Sized,
        F::Procedure: Procedure<T> + Send + 'static,
        C: Combiner<F::Procedure> + ?Sized,
    {
        let source = source.resolve();
        let plan = self.plan(&source, min_fork_size, task_count);
        debug!(
            kind = source.kind(),
            size = source.size(),
            tasks = plan.task_count(),
            "batch run planned"
        );
        let size = source.size();
        let visit = move |batch: Batch, procedure: &mut F::Procedure| {
            source.visit(batch, &mut |item| <F::Procedure as Procedure<T>>::value(procedure, item));
        };
        self.drive(plan, size, factory, combiner, visit)
    }

    /// Like [`run`](Self::run), but procedures also receive each element's index.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub fn run_with_index<T, F, C>(
        &self,
        source: Arc<dyn RandomAccess<T>>,
        factory: &F,
        combiner: &mut C,
        min_fork_size: usize,
        task_count: usize,
    ) -> BatchResult<()>
    where
        T: Send + Sync + 'static,
        F: ProcedureFactory + ?Sized,
        F::Procedure: IndexedProcedure<T> + Send + 'static,
        C: Combiner<F::Procedure> + ?Sized,
    {
        let resolved = ResolvedSource::RandomAccess(Arc::clone(&source));
        let plan = self.plan(&resolved, min_fork_size, task_count);
        debug!(size = source.len(), tasks = plan.task_count(), "indexed batch run planned");
        let size = source.len();
        let visit = move |batch: Batch, procedure: &mut F::Procedure| {
            if let Batch::Range { start, end, .. } = batch {
                for i in start..end {
                    <F::Procedure as IndexedProcedure<T>>::value(procedure, source.get(i), i);
                }
            }
        };
        self.drive(plan, size, factory, combiner, visit)
    }

    /// The plan `run` would follow for `source` on this thread.
    pub fn plan<T>(&self, source: &ResolvedSource<T>, min_fork_size: usize, task_count: usize) -> Plan {
        match Plan::for_source(source, min_fork_size, task_count) {
            Plan::Parallel(_) if inside_batch_task() => {
                trace!("nested run inside a batch task; running serially");
                Plan::Serial(whole(source))
            }
            plan => plan,
        }
    }

    fn drive<P, F, C, V>(
        &self,
        plan: Plan,
        size: usize,
        factory: &F,
        combiner: &mut C,
        visit: V,
    ) -> BatchResult<()>
    where
        F: ProcedureFactory<Procedure = P> + ?Sized,
        P: Send + 'static,
        C: Combiner<P> + ?Sized,
        V: Fn(Batch, &mut P) + Clone + Send + 'static,
    {
        if let Some(m) = &self.metrics {
            m.record_start();
        }
        let result = match plan {
            Plan::Empty => Ok(()),
            Plan::Serial(batch) => self.run_serial(batch, factory, combiner, visit),
            Plan::Parallel(batches) => self.run_parallel(batches, factory, combiner, visit),
        };
        if let Some(m) = &self.metrics {
            m.record_end();
            match result {
                Ok(()) => m.increment_counter("elements_processed", size as u64),
                Err(_) => m.increment_counter("runs_failed", 1),
            }
        }
        result
    }

    fn run_serial<P, F, C, V>(&self, batch: Batch, factory: &F, combiner: &mut C, visit: V) -> BatchResult<()>
    where
        F: ProcedureFactory<Procedure = P> + ?Sized,
        C: Combiner<P> + ?Sized,
        V: Fn(Batch, &mut P),
    {
        if let Some(m) = &self.metrics {
            m.increment_counter("runs_serial", 1);
        }
        let mut procedure = factory.create();
        panic::catch_unwind(AssertUnwindSafe(|| visit(batch, &mut procedure)))
            .map_err(|payload| BatchError::from_panic(0, payload.as_ref()))?;
        if combiner.use_combine_one() {
            combiner.combine_one(procedure);
        } else {
            combiner.combine_all(vec![procedure]);
        }
        Ok(())
    }

    fn run_parallel<P, F, C, V>(
        &self,
        batches: Vec<Batch>,
        factory: &F,
        combiner: &mut C,
        visit: V,
    ) -> BatchResult<()>
    where
        F: ProcedureFactory<Procedure = P> + ?Sized,
        P: Send + 'static,
        C: Combiner<P> + ?Sized,
        V: Fn(Batch, &mut P) + Clone + Send + 'static,
    {
        let submitted = batches.len();
        if let Some(m) = &self.metrics {
            m.increment_counter("runs_parallel", 1);
            m.increment_counter("tasks_submitted", submitted as u64);
        }

        let (tx, rx) = channel::unbounded::<TaskReport<P>>();
        for batch in batches {
            let mut procedure = factory.create();
            let tx = tx.clone();
            let visit = visit.clone();
            self.executor.execute(Box::new(move || {
                let index = batch.index();
                trace!(batch = index, "task started");
                let outcome = {
                    let _scope = TaskScope::enter();
                    panic::catch_unwind(AssertUnwindSafe(|| visit(batch, &mut procedure)))
                };
                let outcome = outcome
                    .map(|()| procedure)
                    .map_err(|payload| panic_message(payload.as_ref()));
                // The caller only stops listening after every report arrived.
                let _ = tx.send(TaskReport {
                    batch: index,
                    outcome,
                });
            }));
        }
        drop(tx);
        debug!(tasks = submitted, "batch tasks dispatched; awaiting");

        let combine_one = combiner.use_combine_one();
        let mut ordered: Vec<Option<P>> = (0..submitted).map(|_| None).collect();
        let mut failure: Option<BatchError> = None;
        let mut received = 0;

        while received < submitted {
            let Ok(report) = rx.recv() else {
                return Err(failure.unwrap_or(BatchError::Disconnected {
                    submitted,
                    missing: submitted - received,
                }));
            };
            received += 1;
            match report.outcome {
                Ok(procedure) if failure.is_none() => {
                    if combine_one {
                        combiner.combine_one(procedure);
                    } else if let Some(slot) = ordered.get_mut(report.batch) {
                        *slot = Some(procedure);
                    }
                }
                Ok(_) => {}
                Err(message) => {
                    if failure.is_none() {
                        debug!(batch = report.batch, %message, "batch task failed");
                        failure = Some(BatchError::TaskFailed {
                            batch: report.batch,
                            message,
                        });
                    } else {
                        warn!(batch = report.batch, %message, "suppressed secondary task failure");
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if !combine_one {
            combiner.combine_all(ordered.into_iter().flatten().collect());
        }
        trace!(tasks = submitted, "batch run combined");
        Ok(())
    }
}
