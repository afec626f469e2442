//! Every element is visited exactly once, whatever the source shape, size or task count.

use anyhow::Result;
use ironbatch::combiners::{ListCombiner, ListProcedure};
use ironbatch::pool::WorkerPool;
use ironbatch::runner::BatchRunner;
use ironbatch::source::{Batch, BatchIterable, BatchSource, Buckets, ResolvedSource, split_ranges};
use proptest::prelude::*;
use std::sync::Arc;


fn copy_all() -> impl Fn() -> ListProcedure<u32, fn(&u32, &mut Vec<u32>)> {
    fn push(x: &u32, out: &mut Vec<u32>) {
        out.push(*x);
    }
    || ListProcedure::new(push as fn(&u32, &mut Vec<u32>))
}

fn visited(runner: &BatchRunner, source: BatchSource<u32>, tasks: usize) -> Result<Vec<u32>> {
    let mut combiner = ListCombiner::new(true);
    runner.run(source, &copy_all(), &mut combiner, 1, tasks)?;
    Ok(combiner.into_result())
}

#[test]
fn all_strategies_cover_every_element_once() -> Result<()> {
    let runners = [
        BatchRunner::inline(),
        BatchRunner::new(Arc::new(WorkerPool::new("partition", 3, false))),
    ];
    for runner in &runners {
        for size in 0..=20u32 {
            let expected: Vec<u32> = (0..size).collect();
            for tasks in 1..=6 {
                let ranges = visited(runner, expected.clone().into(), tasks)?;
                assert_same_elements!(ranges, expected.clone());

                let buckets = Arc::new(Buckets::hashed(0..size, 5));
                let sections = visited(runner, BatchSource::batched(buckets), tasks)?;
                assert_same_elements!(sections, expected.clone());

                let iterated = visited(runner, BatchSource::iterable(0..size), tasks)?;
                assert_same_elements!(iterated, expected.clone());
            }
        }
    }
    Ok(())
}

#[test]
fn mismatched_batch_kinds_still_partition() {
    let flat: ResolvedSource<u32> = BatchSource::from((0..11u32).collect::<Vec<_>>()).resolve();
    let mut seen = Vec::new();
    for index in 0..3 {
        flat.visit(Batch::Section { index, count: 3 }, &mut |x| seen.push(*x));
    }
    assert_eq!(seen, (0..11).collect::<Vec<_>>());

    let bucketed: ResolvedSource<u32> =
        BatchSource::batched(Arc::new(Buckets::from_buckets(vec![vec![0, 1, 2], vec![3], vec![4, 5]]))).resolve();
    let mut seen = Vec::new();
    for batch in split_ranges(6, 4) {
        bucketed.visit(batch, &mut |x| seen.push(*x));
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn bucket_sections_balance_by_element_count() {
    let lopsided = Buckets::from_buckets(vec![
        (0..10u32).collect(),
        vec![10],
        vec![11],
        vec![12],
        vec![13],
        vec![14],
        vec![15],
    ]);
    assert_eq!(lopsided.batch_count(8), 2);

    let source: ResolvedSource<u32> = BatchSource::batched(Arc::new(lopsided)).resolve();
    let section = |index| {
        let mut seen = Vec::new();
        source.visit(Batch::Section { index, count: 2 }, &mut |x| seen.push(*x));
        seen
    };
    // the ten-element bucket is never split, and fills its section alone
    assert_eq!(section(0), (0..10).collect::<Vec<_>>());
    assert_eq!(section(1), (10..16).collect::<Vec<_>>());
}

#[test]
fn empty_buckets_still_partition() {
    let empty: ResolvedSource<u32> = BatchSource::batched(Arc::new(Buckets::new(4))).resolve();
    for index in 0..3 {
        empty.visit(Batch::Section { index, count: 3 }, &mut |_| panic!("no elements"));
    }
}

#[test]
fn last_range_absorbs_the_remainder() {
    let ranges = split_ranges(10, 3);
    assert_eq!(
        ranges,
        vec![
            Batch::Range { index: 0, start: 0, end: 3 },
            Batch::Range { index: 1, start: 3, end: 6 },
            Batch::Range { index: 2, start: 6, end: 10 },
        ]
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ranges_tile_the_source(size in 0usize..2_000, count in 1usize..64) {
        let ranges = split_ranges(size, count);
        prop_assert_eq!(ranges.len(), count);
        let mut next = 0;
        for (i, batch) in ranges.iter().enumerate() {
            let Batch::Range { index, start, end } = *batch else {
                return Err(TestCaseError::fail("expected a range"));
            };
            prop_assert_eq!(index, i);
            prop_assert_eq!(start, next);
            prop_assert!(end >= start);
            next = end;
        }
        prop_assert_eq!(next, size);
    }

    #[test]
    fn parallel_sum_matches_serial(
        values in prop::collection::vec(0u32..1_000, 0..500),
        tasks in 1usize..16,
        min_fork in 0usize..50,
    ) {
        let runner = BatchRunner::inline();
        let total = || ListProcedure::new(|x: &u32, out: &mut Vec<u64>| {
            if out.is_empty() {
                out.push(0);
            }
            out[0] += u64::from(*x);
        });
        let mut combiner = ListCombiner::new(true);
        runner.run(values.clone().into(), &total, &mut combiner, min_fork, tasks)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let parallel: u64 = combiner.into_result().into_iter().sum();
        let serial: u64 = values.iter().map(|x| u64::from(*x)).sum();
        prop_assert_eq!(parallel, serial);
    }
}
