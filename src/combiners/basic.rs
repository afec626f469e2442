//! Basic procedures and combiners: pass-through, counting, list assembly, grouping.

use std::collections::HashMap;
use std::hash::Hash;

use crate::combiners::Combiner;
use crate::procedure::Procedure;

/* ===================== PassThruCombiner ===================== */

/// Discards every procedure.
///
/// For runs whose procedures write into shared, internally synchronised state
/// (see [`PassThruFactory`](crate::procedure::PassThruFactory)).
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThruCombiner;

impl<P> Combiner<P> for PassThruCombiner {
    fn use_combine_one(&self) -> bool {
        true
    }

    fn combine_one(&mut self, _part: P) {}

    fn combine_all(&mut self, _parts: Vec<P>) {}
}

/* ===================== Count ===================== */

/// Counts the elements matching a predicate.
#[derive(Clone, Debug)]
pub struct CountProcedure<F> {
    predicate: F,
    count: usize,
}

impl<F> CountProcedure<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate, count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl<T: ?Sized, F> Procedure<T> for CountProcedure<F>
where
    F: Fn(&T) -> bool,
{
    fn value(&mut self, item: &T) {
        if (self.predicate)(item) {
            self.count += 1;
        }
    }
}

/// Sums the counts of finished [`CountProcedure`]s. Order-insensitive.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountCombiner {
    count: usize,
}

impl CountCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl<F> Combiner<CountProcedure<F>> for CountCombiner {
    fn use_combine_one(&self) -> bool {
        true
    }

    fn combine_one(&mut self, part: CountProcedure<F>) {
        self.count += part.count;
    }
}

/* ===================== Lists ===================== */

/// Builds a local list; `emit` decides what each element contributes.
///
/// Select, reject, collect and flat-collect are all `ListProcedure`s with different
/// emitters.
#[derive(Clone, Debug)]
pub struct ListProcedure<O, F> {
    emit: F,
    items: Vec<O>,
}

impl<O, F> ListProcedure<O, F> {
    pub fn new(emit: F) -> Self {
        Self {
            emit,
            items: Vec::new(),
        }
    }

    pub fn with_capacity(emit: F, capacity: usize) -> Self {
        Self {
            emit,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn items(&self) -> &[O] {
        &self.items
    }

    pub fn into_items(self) -> Vec<O> {
        self.items
    }
}

impl<T: ?Sized, O, F> Procedure<T> for ListProcedure<O, F>
where
    F: FnMut(&T, &mut Vec<O>),
{
    fn value(&mut self, item: &T) {
        (self.emit)(item, &mut self.items);
    }
}

/// Concatenates per-task lists.
///
/// With `allow_reordered == false` the lists arrive through `combine_all` in batch
/// order, so the result keeps source order. With `allow_reordered == true` each list
/// is appended as its task completes.
#[derive(Clone, Debug)]
pub struct ListCombiner<O> {
    result: Vec<O>,
    allow_reordered: bool,
}

impl<O> ListCombiner<O> {
    pub fn new(allow_reordered: bool) -> Self {
        Self {
            result: Vec::new(),
            allow_reordered,
        }
    }

    /// Append onto an existing target list.
    pub fn into_target(target: Vec<O>, allow_reordered: bool) -> Self {
        Self {
            result: target,
            allow_reordered,
        }
    }

    pub fn result(&self) -> &[O] {
        &self.result
    }

    pub fn into_result(self) -> Vec<O> {
        self.result
    }
}

impl<O, F> Combiner<ListProcedure<O, F>> for ListCombiner<O> {
    fn use_combine_one(&self) -> bool {
        self.allow_reordered
    }

    fn combine_one(&mut self, part: ListProcedure<O, F>) {
        if self.result.is_empty() {
            self.result = part.items;
        } else {
            self.result.extend(part.items);
        }
    }

    fn combine_all(&mut self, parts: Vec<ListProcedure<O, F>>) {
        let total: usize = parts.iter().map(|p| p.items.len()).sum();
        self.result.reserve(total);
        for part in parts {
            self.result.extend(part.items);
        }
    }
}

/* ===================== GroupBy ===================== */

/// Groups cloned elements by a key function into a local map.
#[derive(Clone, Debug)]
pub struct GroupByProcedure<K, V, F> {
    key_fn: F,
    groups: HashMap<K, Vec<V>>,
}

impl<K, V, F> GroupByProcedure<K, V, F> {
    pub fn new(key_fn: F) -> Self {
        Self {
            key_fn,
            groups: HashMap::new(),
        }
    }

    pub fn groups(&self) -> &HashMap<K, Vec<V>> {
        &self.groups
    }
}

impl<K, V, F> Procedure<V> for GroupByProcedure<K, V, F>
where
    K: Eq + Hash,
    V: Clone,
    F: Fn(&V) -> K,
{
    fn value(&mut self, item: &V) {
        self.groups
            .entry((self.key_fn)(item))
            .or_default()
            .push(item.clone());
    }
}

/// Merges per-task groups.
///
/// Within each key, values keep source order unless `allow_reordered` is set.
#[derive(Clone, Debug)]
pub struct GroupByCombiner<K, V> {
    result: HashMap<K, Vec<V>>,
    allow_reordered: bool,
}

impl<K: Eq + Hash, V> GroupByCombiner<K, V> {
    pub fn new(allow_reordered: bool) -> Self {
        Self {
            result: HashMap::new(),
            allow_reordered,
        }
    }

    pub fn result(&self) -> &HashMap<K, Vec<V>> {
        &self.result
    }

    pub fn into_result(self) -> HashMap<K, Vec<V>> {
        self.result
    }

    fn merge(&mut self, groups: HashMap<K, Vec<V>>) {
        if self.result.is_empty() {
            self.result = groups;
            return;
        }
        for (key, values) in groups {
            self.result.entry(key).or_default().extend(values);
        }
    }
}

impl<K: Eq + Hash, V, F> Combiner<GroupByProcedure<K, V, F>> for GroupByCombiner<K, V> {
    fn use_combine_one(&self) -> bool {
        self.allow_reordered
    }

    fn combine_one(&mut self, part: GroupByProcedure<K, V, F>) {
        self.merge(part.groups);
    }

    fn combine_all(&mut self, parts: Vec<GroupByProcedure<K, V, F>>) {
        for part in parts {
            self.merge(part.groups);
        }
    }
}
