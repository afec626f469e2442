//! Per-key aggregation driven by a [`CombineFn`].
//!
//! Each task folds its batch into a local `HashMap<K, Acc>`; the
//! [`AggregateCombiner`] merges those maps one at a time as tasks complete, which is
//! sound because every `CombineFn::merge` here is associative and commutative.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::mem::take;
use std::ops::Add;
use std::sync::Arc;

use crate::combiners::summation::CompensatedSum;
use crate::combiners::Combiner;
use crate::procedure::Procedure;

/// An aggregation: create an accumulator, add inputs, merge accumulators, finish.
///
/// `merge` must be associative and commutative; partial accumulators are merged in
/// task completion order.
pub trait CombineFn<V>: Send + Sync + 'static {
    type Acc;
    type Output;

    fn create(&self) -> Self::Acc;

    fn add_input(&self, acc: &mut Self::Acc, v: V);

    fn merge(&self, acc: &mut Self::Acc, other: Self::Acc);

    fn finish(&self, acc: Self::Acc) -> Self::Output;
}

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Local per-key accumulators for one task.
pub struct AggregateProcedure<T, K, V, C: CombineFn<V>> {
    comb: Arc<C>,
    key_fn: KeyFn<T, K>,
    value_fn: KeyFn<T, V>,
    accs: HashMap<K, C::Acc>,
}

impl<T, K, V, C: CombineFn<V>> AggregateProcedure<T, K, V, C> {
    pub fn new(comb: Arc<C>, key_fn: KeyFn<T, K>, value_fn: KeyFn<T, V>) -> Self {
        Self {
            comb,
            key_fn,
            value_fn,
            accs: HashMap::new(),
        }
    }

    pub fn accumulators(&self) -> &HashMap<K, C::Acc> {
        &self.accs
    }
}

impl<T, K, V, C> Procedure<T> for AggregateProcedure<T, K, V, C>
where
    K: Eq + Hash,
    C: CombineFn<V>,
{
    fn value(&mut self, item: &T) {
        let key = (self.key_fn)(item);
        let value = (self.value_fn)(item);
        let acc = self
            .accs
            .entry(key)
            .or_insert_with(|| self.comb.create());
        self.comb.add_input(acc, value);
    }
}

/// Merges per-task accumulator maps.
pub struct AggregateCombiner<K, V, C: CombineFn<V>> {
    comb: Arc<C>,
    accs: HashMap<K, C::Acc>,
    _v: PhantomData<fn(V)>,
}

impl<K: Eq + Hash, V, C: CombineFn<V>> AggregateCombiner<K, V, C> {
    pub fn new(comb: Arc<C>) -> Self {
        Self {
            comb,
            accs: HashMap::new(),
            _v: PhantomData,
        }
    }

    /// Finish every accumulator.
    pub fn finish(self) -> HashMap<K, C::Output> {
        let comb = self.comb;
        self.accs
            .into_iter()
            .map(|(k, acc)| (k, comb.finish(acc)))
            .collect()
    }
}

impl<T, K, V, C> Combiner<AggregateProcedure<T, K, V, C>> for AggregateCombiner<K, V, C>
where
    K: Eq + Hash,
    C: CombineFn<V>,
{
    fn use_combine_one(&self) -> bool {
        true
    }

    fn combine_one(&mut self, part: AggregateProcedure<T, K, V, C>) {
        if self.accs.is_empty() {
            self.accs = part.accs;
            return;
        }
        for (key, acc) in part.accs {
            match self.accs.entry(key) {
                Entry::Occupied(mut e) => self.comb.merge(e.get_mut(), acc),
                Entry::Vacant(e) => {
                    e.insert(acc);
                }
            }
        }
    }
}

/* ===================== Count ===================== */

/// Number of values per key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Count;

impl<V> CombineFn<V> for Count {
    type Acc = u64;
    type Output = u64;

    fn create(&self) -> u64 {
        0
    }

    fn add_input(&self, acc: &mut u64, _v: V) {
        *acc += 1;
    }

    fn merge(&self, acc: &mut u64, other: u64) {
        *acc += other;
    }

    fn finish(&self, acc: u64) -> u64 {
        acc
    }
}

/* ===================== Sum<T> ===================== */

/// Sum of values per key. Floating-point values should prefer
/// [`sum_by_f64`](crate::parallel::Parallel::sum_by_f64), which compensates.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum<T>(PhantomData<fn(T)>);

impl<T> Sum<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T> for Sum<T>
where
    T: Add<Output = T> + Default + 'static,
{
    type Acc = T;
    type Output = T;

    fn create(&self) -> T {
        T::default()
    }

    fn add_input(&self, acc: &mut T, v: T) {
        *acc = take(acc) + v;
    }

    fn merge(&self, acc: &mut T, other: T) {
        *acc = take(acc) + other;
    }

    fn finish(&self, acc: T) -> T {
        acc
    }
}

/* ===================== Min<T> / Max<T> ===================== */

/// Smallest value per key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Min<T>(PhantomData<fn(T)>);

impl<T> Min<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Ord + 'static> CombineFn<T> for Min<T> {
    type Acc = Option<T>;
    type Output = Option<T>;

    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, v: T) {
        match acc {
            Some(cur) if *cur <= v => {}
            _ => *acc = Some(v),
        }
    }

    fn merge(&self, acc: &mut Option<T>, other: Option<T>) {
        if let Some(v) = other {
            self.add_input(acc, v);
        }
    }

    fn finish(&self, acc: Option<T>) -> Option<T> {
        acc
    }
}

/// Largest value per key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Max<T>(PhantomData<fn(T)>);

impl<T> Max<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Ord + 'static> CombineFn<T> for Max<T> {
    type Acc = Option<T>;
    type Output = Option<T>;

    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, v: T) {
        match acc {
            Some(cur) if *cur >= v => {}
            _ => *acc = Some(v),
        }
    }

    fn merge(&self, acc: &mut Option<T>, other: Option<T>) {
        if let Some(v) = other {
            self.add_input(acc, v);
        }
    }

    fn finish(&self, acc: Option<T>) -> Option<T> {
        acc
    }
}

/* ===================== AverageF64 ===================== */

/// Mean per key as `f64`, accumulated with compensated summation.
///
/// Empty groups produce `0.0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AverageF64;

impl<V: Into<f64>> CombineFn<V> for AverageF64 {
    type Acc = (CompensatedSum, u64);
    type Output = f64;

    fn create(&self) -> (CompensatedSum, u64) {
        (CompensatedSum::new(), 0)
    }

    fn add_input(&self, acc: &mut (CompensatedSum, u64), v: V) {
        acc.0.add(v.into());
        acc.1 += 1;
    }

    fn merge(&self, acc: &mut (CompensatedSum, u64), other: (CompensatedSum, u64)) {
        acc.0.merge(other.0);
        acc.1 += other.1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&self, acc: (CompensatedSum, u64)) -> f64 {
        if acc.1 == 0 {
            0.0
        } else {
            acc.0.value() / acc.1 as f64
        }
    }
}
