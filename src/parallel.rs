//! Parallel versions of common collection operations.
//!
//! [`Parallel`] pairs a [`BatchRunner`] with a [`ParallelConfig`] and builds the
//! procedure factory and combiner for each operation. Every operation returns the
//! same result as its sequential counterpart; order-sensitive operations (`select`,
//! `reject`, `collect`, `collect_if`, `flat_collect`, `group_by`) keep source order
//! unless the config allows reordering.
//!
//! ```
//! use ironbatch::config::ParallelConfig;
//! use ironbatch::parallel::Parallel;
//! use ironbatch::runner::BatchRunner;
//!
//! # fn main() -> anyhow::Result<()> {
//! let par = Parallel::new(BatchRunner::inline(), ParallelConfig::default().with_batch_size(10));
//! let evens = par.select((1..=100u32).collect::<Vec<_>>(), |x: &u32| x % 2 == 0)?;
//! assert_eq!(evens.len(), 50);
//! assert_eq!(evens[..3], [2, 4, 6]);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::combiners::{
    AggregateCombiner, AggregateProcedure, CombineFn, Combiner, CountCombiner, CountProcedure,
    GroupByCombiner, GroupByProcedure, ListCombiner, ListProcedure, PassThruCombiner,
    SumByF64Combiner, SumByF64Procedure, SumByI64Combiner, SumByI64Procedure,
};
use crate::config::ParallelConfig;
use crate::procedure::{IndexedProcedure, PassThruFactory, Procedure, ProcedureFactory};
use crate::runner::BatchRunner;
use crate::sizing::{batched_task_count, task_count};
use crate::source::{BatchSource, RandomAccess, ResolvedSource};

/// A runner plus sizing policy.
#[derive(Clone, Debug, Default)]
pub struct Parallel {
    runner: BatchRunner,
    config: ParallelConfig,
}

impl Parallel {
    pub fn new(runner: BatchRunner, config: ParallelConfig) -> Self {
        Self { runner, config }
    }

    #[must_use]
    pub fn with_config(mut self, config: ParallelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runner(&self) -> &BatchRunner {
        &self.runner
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// `(min_fork_size, task_count)` for `source` under the current config.
    pub fn sizing<T>(&self, source: &ResolvedSource<T>) -> (usize, usize) {
        let min_fork = self.config.effective_min_fork_size();
        let tasks = match self.config.task_count {
            Some(n) => n,
            None => {
                let base = task_count(source.size(), self.config.batch_size);
                match source {
                    ResolvedSource::Batched(s) => batched_task_count(s.as_ref(), base),
                    ResolvedSource::RandomAccess(_) => base,
                }
            }
        };
        (min_fork, tasks)
    }

    /// Run an arbitrary factory and combiner over `source`.
    ///
    /// # Errors
    ///
    /// If any task panics.
    pub fn for_each_with<T, F, C>(
        &self,
        source: impl Into<BatchSource<T>>,
        factory: &F,
        combiner: &mut C,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: ProcedureFactory + ?Sized,
        F::Procedure: Procedure<T> + Send + 'static,
        C: Combiner<F::Procedure> + ?Sized,
    {
        let source = source.into().resolve();
        let (min_fork, tasks) = self.sizing(&source);
        self.runner
            .run(source.into(), factory, combiner, min_fork, tasks)
            .context("parallel batch run failed")
    }

    /// Feed every element to clones of one shared, concurrency-safe procedure.
    ///
    /// # Errors
    ///
    /// If any task panics.
    pub fn for_each<T, P>(&self, source: impl Into<BatchSource<T>>, procedure: P) -> Result<()>
    where
        T: Send + Sync + 'static,
        P: Procedure<T> + Clone + Send + 'static,
    {
        let factory = PassThruFactory::new(procedure);
        self.for_each_with(source, &factory, &mut PassThruCombiner)
            .context("parallel for_each failed")
    }

    /// Like [`for_each`](Self::for_each), passing each element's index.
    ///
    /// # Errors
    ///
    /// If any task panics.
    pub fn for_each_with_index<T, P>(&self, source: Arc<dyn RandomAccess<T>>, procedure: P) -> Result<()>
    where
        T: Send + Sync + 'static,
        P: IndexedProcedure<T> + Clone + Send + 'static,
    {
        let resolved = ResolvedSource::RandomAccess(Arc::clone(&source));
        let (min_fork, tasks) = self.sizing(&resolved);
        let factory = PassThruFactory::new(procedure);
        self.runner
            .run_with_index(source, &factory, &mut PassThruCombiner, min_fork, tasks)
            .context("parallel for_each_with_index failed")
    }

    fn assemble<T, O, E>(&self, source: impl Into<BatchSource<T>>, emit: E, what: &'static str) -> Result<Vec<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        E: Fn(&T, &mut Vec<O>) + Send + Sync + 'static,
    {
        let emit = Arc::new(emit);
        let factory = move || {
            let emit = Arc::clone(&emit);
            ListProcedure::new(move |item: &T, out: &mut Vec<O>| emit(item, out))
        };
        let mut combiner = ListCombiner::new(self.config.allow_reordered);
        self.for_each_with(source, &factory, &mut combiner)
            .with_context(|| format!("parallel {what} failed"))?;
        Ok(combiner.into_result())
    }

    /// Elements matching `predicate`.
    ///
    /// # Errors
    ///
    /// If `predicate` panics.
    pub fn select<T, P>(&self, source: impl Into<BatchSource<T>>, predicate: P) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.assemble(
            source,
            move |item: &T, out: &mut Vec<T>| {
                if predicate(item) {
                    out.push(item.clone());
                }
            },
            "select",
        )
    }

    /// Elements not matching `predicate`.
    ///
    /// # Errors
    ///
    /// If `predicate` panics.
    pub fn reject<T, P>(&self, source: impl Into<BatchSource<T>>, predicate: P) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.assemble(
            source,
            move |item: &T, out: &mut Vec<T>| {
                if !predicate(item) {
                    out.push(item.clone());
                }
            },
            "reject",
        )
    }

    /// `function` applied to every element.
    ///
    /// # Errors
    ///
    /// If `function` panics.
    pub fn collect<T, O, F>(&self, source: impl Into<BatchSource<T>>, function: F) -> Result<Vec<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        F: Fn(&T) -> O + Send + Sync + 'static,
    {
        self.assemble(
            source,
            move |item: &T, out: &mut Vec<O>| out.push(function(item)),
            "collect",
        )
    }

    /// `function` applied to the elements matching `predicate`.
    ///
    /// # Errors
    ///
    /// If `predicate` or `function` panics.
    pub fn collect_if<T, O, P, F>(
        &self,
        source: impl Into<BatchSource<T>>,
        predicate: P,
        function: F,
    ) -> Result<Vec<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(&T) -> O + Send + Sync + 'static,
    {
        self.assemble(
            source,
            move |item: &T, out: &mut Vec<O>| {
                if predicate(item) {
                    out.push(function(item));
                }
            },
            "collect_if",
        )
    }

    /// Concatenation of `function` over every element.
    ///
    /// # Errors
    ///
    /// If `function` panics.
    pub fn flat_collect<T, O, I, F>(&self, source: impl Into<BatchSource<T>>, function: F) -> Result<Vec<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        I: IntoIterator<Item = O>,
        F: Fn(&T) -> I + Send + Sync + 'static,
    {
        self.assemble(
            source,
            move |item: &T, out: &mut Vec<O>| out.extend(function(item)),
            "flat_collect",
        )
    }

    /// Number of elements matching `predicate`.
    ///
    /// # Errors
    ///
    /// If `predicate` panics.
    pub fn count<T, P>(&self, source: impl Into<BatchSource<T>>, predicate: P) -> Result<usize>
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let factory = move || {
            let predicate = Arc::clone(&predicate);
            CountProcedure::new(move |item: &T| predicate(item))
        };
        let mut combiner = CountCombiner::new();
        self.for_each_with(source, &factory, &mut combiner)
            .context("parallel count failed")?;
        Ok(combiner.count())
    }

    /// Elements grouped by `key_fn`.
    ///
    /// # Errors
    ///
    /// If `key_fn` panics.
    pub fn group_by<T, K, F>(&self, source: impl Into<BatchSource<T>>, key_fn: F) -> Result<HashMap<K, Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
        K: Eq + Hash + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let key_fn = Arc::new(key_fn);
        let factory = move || {
            let key_fn = Arc::clone(&key_fn);
            GroupByProcedure::<K, T, _>::new(move |item: &T| key_fn(item))
        };
        let mut combiner = GroupByCombiner::new(self.config.allow_reordered);
        self.for_each_with(source, &factory, &mut combiner)
            .context("parallel group_by failed")?;
        Ok(combiner.into_result())
    }

    /// `comb` applied per key to the values extracted by `value_fn`.
    ///
    /// # Errors
    ///
    /// If `key_fn`, `value_fn` or `comb` panics.
    pub fn aggregate_by<T, K, V, C, KF, VF>(
        &self,
        source: impl Into<BatchSource<T>>,
        key_fn: KF,
        value_fn: VF,
        comb: C,
    ) -> Result<HashMap<K, C::Output>>
    where
        T: Send + Sync + 'static,
        K: Eq + Hash + Send + 'static,
        V: 'static,
        C: CombineFn<V>,
        C::Acc: Send + 'static,
        KF: Fn(&T) -> K + Send + Sync + 'static,
        VF: Fn(&T) -> V + Send + Sync + 'static,
    {
        let comb = Arc::new(comb);
        let key_fn: Arc<dyn Fn(&T) -> K + Send + Sync> = Arc::new(key_fn);
        let value_fn: Arc<dyn Fn(&T) -> V + Send + Sync> = Arc::new(value_fn);
        let factory = {
            let comb = Arc::clone(&comb);
            move || AggregateProcedure::new(Arc::clone(&comb), Arc::clone(&key_fn), Arc::clone(&value_fn))
        };
        let mut combiner = AggregateCombiner::<K, V, C>::new(comb);
        self.for_each_with(source, &factory, &mut combiner)
            .context("parallel aggregate_by failed")?;
        Ok(combiner.finish())
    }

    /// Per-key compensated sums of `function`.
    ///
    /// # Errors
    ///
    /// If `group_by` or `function` panics.
    pub fn sum_by_f64<T, K, G, F>(
        &self,
        source: impl Into<BatchSource<T>>,
        group_by: G,
        function: F,
    ) -> Result<HashMap<K, f64>>
    where
        T: Send + Sync + 'static,
        K: Eq + Hash + Send + 'static,
        G: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        let group_by: Arc<dyn Fn(&T) -> K + Send + Sync> = Arc::new(group_by);
        let function: Arc<dyn Fn(&T) -> f64 + Send + Sync> = Arc::new(function);
        let factory = move || SumByF64Procedure::new(Arc::clone(&group_by), Arc::clone(&function));
        let mut combiner = SumByF64Combiner::new();
        self.for_each_with(source, &factory, &mut combiner)
            .context("parallel sum_by_f64 failed")?;
        Ok(combiner.into_result())
    }

    /// Per-key compensated sums of an `f32` function, accumulated as `f64`.
    ///
    /// # Errors
    ///
    /// If `group_by` or `function` panics.
    pub fn sum_by_f32<T, K, G, F>(
        &self,
        source: impl Into<BatchSource<T>>,
        group_by: G,
        function: F,
    ) -> Result<HashMap<K, f64>>
    where
        T: Send + Sync + 'static,
        K: Eq + Hash + Send + 'static,
        G: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(&T) -> f32 + Send + Sync + 'static,
    {
        self.sum_by_f64(source, group_by, move |item: &T| f64::from(function(item)))
    }

    /// Per-key wrapping integer sums of `function`.
    ///
    /// # Errors
    ///
    /// If `group_by` or `function` panics.
    pub fn sum_by_i64<T, K, G, F>(
        &self,
        source: impl Into<BatchSource<T>>,
        group_by: G,
        function: F,
    ) -> Result<HashMap<K, i64>>
    where
        T: Send + Sync + 'static,
        K: Eq + Hash + Send + 'static,
        G: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        let group_by: Arc<dyn Fn(&T) -> K + Send + Sync> = Arc::new(group_by);
        let function: Arc<dyn Fn(&T) -> i64 + Send + Sync> = Arc::new(function);
        let factory = move || SumByI64Procedure::new(Arc::clone(&group_by), Arc::clone(&function));
        let mut combiner = SumByI64Combiner::new();
        self.for_each_with(source, &factory, &mut combiner)
            .context("parallel sum_by_i64 failed")?;
        Ok(combiner.into_result())
    }
}
