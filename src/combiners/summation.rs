//! Grouped sums.
//!
//! Floating-point sums carry a running compensation term per key (Neumaier's variant
//! of Kahan summation), both inside each task and when the combiner folds one task's
//! partial sums into another's. Naively adding per-task sums would throw away the
//! low-order bits every task worked to keep, with error growing with the task count.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::combiners::Combiner;
use crate::procedure::Procedure;

/// A floating-point sum with a compensation term for lost low-order bits.
///
/// Numerically delicate: check any change against the compensated-sum property tests.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one value.
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if t.is_finite() {
            if self.sum.abs() >= value.abs() {
                self.compensation += (self.sum - t) + value;
            } else {
                self.compensation += (value - t) + self.sum;
            }
        }
        self.sum = t;
    }

    /// Fold another compensated sum into this one.
    ///
    /// The other sum's running total goes through the same correction step as a single
    /// value; its compensation joins ours.
    pub fn merge(&mut self, other: CompensatedSum) {
        self.add(other.sum);
        self.compensation += other.compensation;
    }

    /// The corrected total.
    pub fn value(&self) -> f64 {
        if self.sum.is_finite() {
            self.sum + self.compensation
        } else {
            self.sum
        }
    }

    /// The uncorrected running total.
    pub fn raw_sum(&self) -> f64 {
        self.sum
    }

    pub fn compensation(&self) -> f64 {
        self.compensation
    }
}

impl FromIterator<f64> for CompensatedSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut out = Self::new();
        for v in iter {
            out.add(v);
        }
        out
    }
}

type Extract<T, R> = Arc<dyn Fn(&T) -> R + Send + Sync>;

/* ===================== f64 ===================== */

/// Per-key compensated sums for one task.
pub struct SumByF64Procedure<T, K> {
    group_by: Extract<T, K>,
    function: Extract<T, f64>,
    sums: HashMap<K, CompensatedSum>,
}

impl<T, K> SumByF64Procedure<T, K> {
    pub fn new(group_by: Extract<T, K>, function: Extract<T, f64>) -> Self {
        Self {
            group_by,
            function,
            sums: HashMap::new(),
        }
    }

    pub fn sums(&self) -> &HashMap<K, CompensatedSum> {
        &self.sums
    }
}

impl<T, K: Eq + Hash> Procedure<T> for SumByF64Procedure<T, K> {
    fn value(&mut self, item: &T) {
        let key = (self.group_by)(item);
        let value = (self.function)(item);
        self.sums.entry(key).or_default().add(value);
    }
}

/// Folds per-task compensated sums key by key. Order-insensitive up to rounding of
/// the compensation terms.
#[derive(Clone, Debug)]
pub struct SumByF64Combiner<K> {
    result: HashMap<K, CompensatedSum>,
}

impl<K: Eq + Hash> Default for SumByF64Combiner<K> {
    fn default() -> Self {
        Self {
            result: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> SumByF64Combiner<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-key sums with their compensation terms.
    pub fn compensated(&self) -> &HashMap<K, CompensatedSum> {
        &self.result
    }

    /// Corrected per-key totals.
    pub fn into_result(self) -> HashMap<K, f64> {
        self.result
            .into_iter()
            .map(|(k, s)| (k, s.value()))
            .collect()
    }
}

impl<T, K: Eq + Hash> Combiner<SumByF64Procedure<T, K>> for SumByF64Combiner<K> {
    fn use_combine_one(&self) -> bool {
        true
    }

    fn combine_one(&mut self, part: SumByF64Procedure<T, K>) {
        if self.result.is_empty() {
            self.result = part.sums;
            return;
        }
        for (key, partial) in part.sums {
            self.result.entry(key).or_default().merge(partial);
        }
    }
}

/* ===================== i64 ===================== */

/// Per-key integer sums for one task. Overflow wraps.
pub struct SumByI64Procedure<T, K> {
    group_by: Extract<T, K>,
    function: Extract<T, i64>,
    sums: HashMap<K, i64>,
}

impl<T, K> SumByI64Procedure<T, K> {
    pub fn new(group_by: Extract<T, K>, function: Extract<T, i64>) -> Self {
        Self {
            group_by,
            function,
            sums: HashMap::new(),
        }
    }
}

impl<T, K: Eq + Hash> Procedure<T> for SumByI64Procedure<T, K> {
    fn value(&mut self, item: &T) {
        let key = (self.group_by)(item);
        let value = (self.function)(item);
        let slot = self.sums.entry(key).or_insert(0);
        *slot = slot.wrapping_add(value);
    }
}

#[derive(Clone, Debug)]
pub struct SumByI64Combiner<K> {
    result: HashMap<K, i64>,
}

impl<K: Eq + Hash> Default for SumByI64Combiner<K> {
    fn default() -> Self {
        Self {
            result: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> SumByI64Combiner<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_result(self) -> HashMap<K, i64> {
        self.result
    }
}

impl<T, K: Eq + Hash> Combiner<SumByI64Procedure<T, K>> for SumByI64Combiner<K> {
    fn use_combine_one(&self) -> bool {
        true
    }

    fn combine_one(&mut self, part: SumByI64Procedure<T, K>) {
        for (key, partial) in part.sums {
            let slot = self.result.entry(key).or_insert(0);
            *slot = slot.wrapping_add(partial);
        }
    }
}
