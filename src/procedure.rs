//! Per-task operations and the factories that create them.
//!
//! A [`Procedure`] is the mutable state one task builds while consuming its batch:
//! a local list of selected elements, a running sum, a per-key map. The runner asks a
//! [`ProcedureFactory`] for a fresh instance immediately before submitting each task,
//! so no two tasks ever share mutable state unless the factory deliberately hands out
//! handles to the same internally synchronised accumulator (see [`PassThruFactory`]
//! and [`Synchronized`]).

use parking_lot::Mutex;
use std::sync::Arc;

/// Consumes elements one at a time, in batch-local order.
pub trait Procedure<T: ?Sized> {
    fn value(&mut self, item: &T);
}

impl<T: ?Sized, F> Procedure<T> for F
where
    F: FnMut(&T),
{
    fn value(&mut self, item: &T) {
        self(item)
    }
}

/// Like [`Procedure`], but also receives the element's absolute index in the source.
pub trait IndexedProcedure<T: ?Sized> {
    fn value(&mut self, item: &T, index: usize);
}

impl<T: ?Sized, F> IndexedProcedure<T> for F
where
    F: FnMut(&T, usize),
{
    fn value(&mut self, item: &T, index: usize) {
        self(item, index)
    }
}

/// Produces one independent procedure instance per task.
///
/// Any `Fn() -> P` closure is a factory.
pub trait ProcedureFactory {
    type Procedure;

    fn create(&self) -> Self::Procedure;
}

impl<F, P> ProcedureFactory for F
where
    F: Fn() -> P,
{
    type Procedure = P;

    fn create(&self) -> P {
        self()
    }
}

/// Hands every task a clone of the same procedure.
///
/// Only sound when cloning yields a handle onto shared, concurrency-safe state
/// (atomics, a [`Synchronized`] procedure, a concurrent map). Pair it with
/// [`PassThruCombiner`](crate::combiners::PassThruCombiner): there is nothing to combine.
#[derive(Clone, Debug)]
pub struct PassThruFactory<P> {
    procedure: P,
}

impl<P: Clone> PassThruFactory<P> {
    pub fn new(procedure: P) -> Self {
        Self { procedure }
    }

    /// The shared procedure, for reading results after the run.
    pub fn procedure(&self) -> &P {
        &self.procedure
    }
}

impl<P: Clone> ProcedureFactory for PassThruFactory<P> {
    type Procedure = P;

    fn create(&self) -> P {
        self.procedure.clone()
    }
}

/// A procedure shared between tasks behind a mutex.
///
/// Every element takes the lock, so this trades throughput for the convenience of a
/// single accumulator.
pub struct Synchronized<P> {
    inner: Arc<Mutex<P>>,
}

impl<P> Synchronized<P> {
    pub fn new(procedure: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(procedure)),
        }
    }

    /// Run `f` against the wrapped procedure.
    pub fn with<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Unwrap the procedure if this is the last handle to it.
    pub fn try_into_inner(self) -> Result<P, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl<P> Clone for Synchronized<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized, P: Procedure<T>> Procedure<T> for Synchronized<P> {
    fn value(&mut self, item: &T) {
        <P as Procedure<T>>::value(&mut self.inner.lock(), item);
    }
}

impl<T: ?Sized, P: IndexedProcedure<T>> IndexedProcedure<T> for Synchronized<P> {
    fn value(&mut self, item: &T, index: usize) {
        <P as IndexedProcedure<T>>::value(&mut self.inner.lock(), item, index);
    }
}
