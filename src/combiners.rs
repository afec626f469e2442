//! Reduction of per-task results.
//!
//! After every task of a run has finished, the runner hands the per-task procedures
//! to a [`Combiner`] in one of two ways:
//!
//! - **one at a time** ([`Combiner::combine_one`]), in *completion* order, while other
//!   tasks may still be running. Only correct for associative, commutative reductions.
//! - **all at once** ([`Combiner::combine_all`]), in *batch* order, after the last task
//!   finished. Required for anything that must preserve source order.
//!
//! The submodules provide the combiners used by the [`parallel`](crate::parallel)
//! facade:
//!
//! - [`basic`]: pass-through, counting, list assembly, grouping
//! - [`aggregate`]: per-key aggregation driven by a [`CombineFn`](aggregate::CombineFn)
//! - [`summation`]: grouped sums with compensated floating-point accumulation

pub mod aggregate;
pub mod basic;
pub mod summation;

pub use aggregate::{
    AggregateCombiner, AggregateProcedure, AverageF64, CombineFn, Count, Max, Min, Sum,
};
pub use basic::{
    CountCombiner, CountProcedure, GroupByCombiner, GroupByProcedure, ListCombiner, ListProcedure,
    PassThruCombiner,
};
pub use summation::{
    CompensatedSum, SumByF64Combiner, SumByF64Procedure, SumByI64Combiner, SumByI64Procedure,
};

/// Merges the procedures produced by one run.
pub trait Combiner<P> {
    /// Whether the runner should call [`combine_one`](Self::combine_one) as tasks complete.
    fn use_combine_one(&self) -> bool;

    /// Fold one finished procedure into the result.
    fn combine_one(&mut self, part: P);

    /// Receive every finished procedure, ordered by batch index.
    ///
    /// An empty `parts` is a no-op.
    fn combine_all(&mut self, parts: Vec<P>) {
        for part in parts {
            self.combine_one(part);
        }
    }
}

impl<P, C: Combiner<P> + ?Sized> Combiner<P> for &mut C {
    fn use_combine_one(&self) -> bool {
        (**self).use_combine_one()
    }

    fn combine_one(&mut self, part: P) {
        (**self).combine_one(part)
    }

    fn combine_all(&mut self, parts: Vec<P>) {
        (**self).combine_all(parts)
    }
}
