//! Batch sources and batch descriptors.
//!
//! The runner understands three kinds of source, resolved once per run:
//!
//! - [`RandomAccess`]: O(1) positional access. Cut into contiguous index ranges.
//! - [`BatchIterable`]: the source knows how to chunk itself (hash buckets, segments)
//!   and runs "section `i` of `n`" natively.
//! - any other iterator: materialized into a `Vec` on the calling thread, then treated
//!   as random access.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Sources with constant-time positional access.
pub trait RandomAccess<T>: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> &T;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Sync> RandomAccess<T> for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn get(&self, index: usize) -> &T {
        &self[index]
    }
}

impl<T: Send + Sync> RandomAccess<T> for Box<[T]> {
    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn get(&self, index: usize) -> &T {
        &self[index]
    }
}

impl<T: Send + Sync> RandomAccess<T> for VecDeque<T> {
    fn len(&self) -> usize {
        VecDeque::len(self)
    }

    fn get(&self, index: usize) -> &T {
        &self[index]
    }
}

/// Sources that decide their own chunk boundaries.
///
/// `batch_for_each(f, i, n)` must visit section `i` of `n`, and the `n` sections must
/// partition the source for every `n >= 1`.
pub trait BatchIterable<T>: Send + Sync {
    fn size(&self) -> usize;

    /// How many batches the source would cut for roughly `batch_size` elements each.
    fn batch_count(&self, batch_size: usize) -> usize;

    fn batch_for_each(&self, f: &mut dyn FnMut(&T), section_index: usize, section_count: usize);
}

/// A source handed to the runner, tagged by capability.
pub enum BatchSource<T> {
    RandomAccess(Arc<dyn RandomAccess<T>>),
    Batched(Arc<dyn BatchIterable<T>>),
    Iterable(Box<dyn Iterator<Item = T>>),
}

impl<T: Send + Sync + 'static> BatchSource<T> {
    pub fn random_access<S: RandomAccess<T> + 'static>(source: Arc<S>) -> Self {
        Self::RandomAccess(source)
    }

    pub fn batched<S: BatchIterable<T> + 'static>(source: Arc<S>) -> Self {
        Self::Batched(source)
    }

    pub fn iterable<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::Iterable(Box::new(iter.into_iter()))
    }

    /// Resolve the capability once: iterators are materialized into a `Vec` here, on
    /// the calling thread.
    pub fn resolve(self) -> ResolvedSource<T> {
        match self {
            Self::RandomAccess(s) => ResolvedSource::RandomAccess(s),
            Self::Batched(s) => ResolvedSource::Batched(s),
            Self::Iterable(iter) => {
                let items: Vec<T> = iter.collect();
                ResolvedSource::RandomAccess(Arc::new(items))
            }
        }
    }

    /// Element count, or `None` for an unresolved iterator.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::RandomAccess(s) => Some(s.len()),
            Self::Batched(s) => Some(s.size()),
            Self::Iterable(_) => None,
        }
    }

    /// Short name of the capability, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RandomAccess(_) => "random-access",
            Self::Batched(_) => "batched",
            Self::Iterable(_) => "iterable",
        }
    }
}

impl<T: Send + Sync + 'static> From<Vec<T>> for BatchSource<T> {
    fn from(v: Vec<T>) -> Self {
        Self::RandomAccess(Arc::new(v))
    }
}

impl<T: Send + Sync + 'static> From<Arc<Vec<T>>> for BatchSource<T> {
    fn from(v: Arc<Vec<T>>) -> Self {
        Self::RandomAccess(v)
    }
}

impl<T> fmt::Debug for BatchSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::RandomAccess(s) => format!("RandomAccess(len = {})", s.len()),
            Self::Batched(s) => format!("Batched(size = {})", s.size()),
            Self::Iterable(_) => "Iterable(..)".to_string(),
        };
        f.write_str(&kind)
    }
}

/// A source whose capability has been settled; cheap to clone into tasks.
pub enum ResolvedSource<T> {
    RandomAccess(Arc<dyn RandomAccess<T>>),
    Batched(Arc<dyn BatchIterable<T>>),
}

impl<T> ResolvedSource<T> {
    pub fn size(&self) -> usize {
        match self {
            Self::RandomAccess(s) => s.len(),
            Self::Batched(s) => s.size(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RandomAccess(_) => "random-access",
            Self::Batched(_) => "batched",
        }
    }

    /// Feed every element of `batch` to `f`, in batch-local order.
    ///
    /// Range batches use index-based traversal; section batches defer to the source.
    pub fn visit(&self, batch: Batch, f: &mut dyn FnMut(&T)) {
        match (self, batch) {
            (Self::RandomAccess(s), Batch::Range { start, end, .. }) => {
                for i in start..end {
                    f(s.get(i));
                }
            }
            (Self::Batched(s), Batch::Section { index, count }) => s.batch_for_each(f, index, count),
            (Self::RandomAccess(s), Batch::Section { index, count }) => {
                if let Some(Batch::Range { start, end, .. }) =
                    split_ranges(s.len(), count).as_slice().get(index).copied()
                {
                    for i in start..end {
                        f(s.get(i));
                    }
                }
            }
            (Self::Batched(s), Batch::Range { start, end, .. }) => {
                let mut position = 0;
                s.batch_for_each(
                    &mut |item| {
                        if (start..end).contains(&position) {
                            f(item);
                        }
                        position += 1;
                    },
                    0,
                    1,
                );
            }
        }
    }
}

impl<T> Clone for ResolvedSource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::RandomAccess(s) => Self::RandomAccess(Arc::clone(s)),
            Self::Batched(s) => Self::Batched(Arc::clone(s)),
        }
    }
}

impl<T> From<ResolvedSource<T>> for BatchSource<T> {
    fn from(source: ResolvedSource<T>) -> Self {
        match source {
            ResolvedSource::RandomAccess(s) => Self::RandomAccess(s),
            ResolvedSource::Batched(s) => Self::Batched(s),
        }
    }
}

/// One task's share of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Batch {
    /// Elements `[start, end)` of a random-access source.
    Range { index: usize, start: usize, end: usize },
    /// Section `index` of `count` of a batch-iterable source.
    Section { index: usize, count: usize },
}

impl Batch {
    pub fn index(&self) -> usize {
        match *self {
            Batch::Range { index, .. } | Batch::Section { index, .. } => index,
        }
    }
}

/// Cut `[0, size)` into `count` contiguous ranges.
///
/// Every range but the last holds `size / count` elements; the last absorbs the
/// remainder. `count` is clamped to at least one.
pub fn split_ranges(size: usize, count: usize) -> Vec<Batch> {
    let count = count.max(1);
    let section = size / count;
    (0..count)
        .map(|index| {
            let start = index * section;
            let end = if index == count - 1 { size } else { start + section };
            Batch::Range { index, start, end }
        })
        .collect()
}

/// `count` section handles for a batch-iterable source.
pub fn sections(count: usize) -> Vec<Batch> {
    let count = count.max(1);
    (0..count).map(|index| Batch::Section { index, count }).collect()
}

/// A bucketed container that chunks along bucket boundaries.
///
/// Elements are spread over a fixed bucket table; batches are runs of whole buckets,
/// so a batch never splits a bucket.
#[derive(Clone, Debug)]
pub struct Buckets<T> {
    buckets: Vec<Vec<T>>,
    len: usize,
}

impl<T> Buckets<T> {
    /// An empty table with `bucket_count` buckets (at least one).
    pub fn new(bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count.max(1)).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    /// Use the given buckets as-is.
    pub fn from_buckets(buckets: Vec<Vec<T>>) -> Self {
        let len = buckets.iter().map(Vec::len).sum();
        let mut out = Self { buckets, len };
        if out.buckets.is_empty() {
            out.buckets.push(Vec::new());
        }
        out
    }

    /// Distribute `items` over `bucket_count` buckets by hash.
    pub fn hashed<I>(items: I, bucket_count: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Hash,
    {
        let mut out = Self::new(bucket_count);
        for item in items {
            let mut h = DefaultHasher::new();
            item.hash(&mut h);
            let slot = (h.finish() % out.buckets.len() as u64) as usize;
            out.push_to(slot, item);
        }
        out
    }

    /// Append `item` to bucket `bucket` (modulo the table size).
    pub fn push_to(&mut self, bucket: usize, item: T) {
        let n = self.buckets.len();
        self.buckets[bucket % n].push(item);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.iter().flatten()
    }

    /// Section owning `bucket`, given the elements stored in the buckets before it.
    ///
    /// Buckets are assigned by where their first element falls in the source, so
    /// sections stay contiguous runs of whole buckets balanced by element count.
    fn section_of(&self, bucket: usize, preceding: usize, section_count: usize) -> usize {
        let section = if self.len == 0 {
            bucket * section_count / self.buckets.len()
        } else {
            (preceding as u128 * section_count as u128 / self.len as u128) as usize
        };
        section.min(section_count - 1)
    }
}

impl<T: Send + Sync> BatchIterable<T> for Buckets<T> {
    fn size(&self) -> usize {
        self.len
    }

    /// Never more batches than buckets, since a batch holds whole buckets.
    fn batch_count(&self, batch_size: usize) -> usize {
        self.len
            .div_ceil(batch_size.max(1))
            .min(self.buckets.len())
            .max(1)
    }

    fn batch_for_each(&self, f: &mut dyn FnMut(&T), section_index: usize, section_count: usize) {
        let count = section_count.max(1);
        let mut preceding = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            match self.section_of(index, preceding, count).cmp(&section_index) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    for item in bucket {
                        f(item);
                    }
                }
                std::cmp::Ordering::Greater => break,
            }
            preceding += bucket.len();
        }
    }
}
