use anyhow::Result;
use ironbatch::combiners::{
    Combiner, CountCombiner, CountProcedure, ListCombiner, ListProcedure, PassThruCombiner,
};
use ironbatch::pool::{Executor, InlineExecutor, Job, WorkerPool};
use ironbatch::procedure::{IndexedProcedure, PassThruFactory, Synchronized};
use ironbatch::runner::{BatchRunner, Plan, inside_batch_task};
use ironbatch::source::{Batch, BatchSource, Buckets, RandomAccess, ResolvedSource};
use ironbatch::BatchError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pooled(size: usize) -> BatchRunner {
    BatchRunner::new(Arc::new(WorkerPool::new("runner-test", size, false)))
}

fn copy_all() -> impl Fn() -> ListProcedure<u32, fn(&u32, &mut Vec<u32>)> {
    fn push(x: &u32, out: &mut Vec<u32>) {
        out.push(*x);
    }
    || ListProcedure::new(push as fn(&u32, &mut Vec<u32>))
}

/// Counts what reached it, without doing anything else.
#[derive(Default)]
struct Recorder {
    use_one: bool,
    one_calls: usize,
    all_calls: usize,
    received: usize,
}

impl<P> Combiner<P> for Recorder {
    fn use_combine_one(&self) -> bool {
        self.use_one
    }

    fn combine_one(&mut self, _part: P) {
        self.one_calls += 1;
        self.received += 1;
    }

    fn combine_all(&mut self, parts: Vec<P>) {
        self.all_calls += 1;
        self.received += parts.len();
    }
}

/// Accepts every job and never runs it.
struct DroppingExecutor;

impl Executor for DroppingExecutor {
    fn execute(&self, _job: Job) {}
}

#[test]
fn evens_in_one_to_hundred() -> Result<()> {
    init_tracing();
    let runner = pooled(4);
    let evens = || CountProcedure::new(|x: &u32| x % 2 == 0);
    let mut count = CountCombiner::new();
    runner.run((1..=100u32).collect::<Vec<_>>().into(), &evens, &mut count, 10, 4)?;
    assert_eq!(count.count(), 50);
    Ok(())
}

#[test]
fn evens_under_heavy_concurrent_use() -> Result<()> {
    let runner = pooled(4);
    let data = Arc::new((1..=100u32).collect::<Vec<_>>());

    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let runner = runner.clone();
                let data = Arc::clone(&data);
                s.spawn(move || -> Result<()> {
                    for _ in 0..125 {
                        let evens = || CountProcedure::new(|x: &u32| x % 2 == 0);
                        let mut count = CountCombiner::new();
                        runner.run(Arc::clone(&data).into(), &evens, &mut count, 10, 4)?;
                        assert_eq!(count.count(), 50);
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().map_err(|_| anyhow::anyhow!("runner thread panicked"))??;
        }
        Ok(())
    })
}

#[test]
fn empty_source_never_touches_factory_or_combiner() -> Result<()> {
    let runner = pooled(2);
    let created = Arc::new(AtomicUsize::new(0));
    let factory = {
        let created = Arc::clone(&created);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            CountProcedure::new(|_: &u32| true)
        }
    };
    let mut recorder = Recorder::default();
    runner.run(Vec::<u32>::new().into(), &factory, &mut recorder, 0, 8)?;

    assert_eq!(created.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.one_calls + recorder.all_calls, 0);
    Ok(())
}

#[test]
fn small_source_runs_serially_with_one_procedure() -> Result<()> {
    let runner = pooled(2);
    let created = Arc::new(AtomicUsize::new(0));
    let factory = {
        let created = Arc::clone(&created);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            CountProcedure::new(|_: &u32| true)
        }
    };
    let mut recorder = Recorder::default();
    runner.run((0..9u32).collect::<Vec<_>>().into(), &factory, &mut recorder, 10, 8)?;

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.all_calls, 1);
    assert_eq!(recorder.received, 1);
    Ok(())
}

#[test]
fn combine_one_sees_every_task_once() -> Result<()> {
    let runner = pooled(3);
    let mut recorder = Recorder {
        use_one: true,
        ..Recorder::default()
    };
    runner.run((0..100u32).collect::<Vec<_>>().into(), &copy_all(), &mut recorder, 1, 7)?;
    assert_eq!(recorder.one_calls, 7);
    assert_eq!(recorder.all_calls, 0);

    let mut recorder = Recorder::default();
    runner.run((0..100u32).collect::<Vec<_>>().into(), &copy_all(), &mut recorder, 1, 7)?;
    assert_eq!(recorder.all_calls, 1);
    assert_eq!(recorder.received, 7);
    Ok(())
}

#[test]
fn combine_all_preserves_source_order_at_boundaries() -> Result<()> {
    let runners = [BatchRunner::inline(), pooled(3)];
    for runner in &runners {
        for size in [1usize, 2, 3, 9, 10, 11, 99, 100, 101] {
            for tasks in 1..=6 {
                let data: Vec<u32> = (0..size as u32).collect();
                let mut combiner = ListCombiner::new(false);
                runner.run(data.clone().into(), &copy_all(), &mut combiner, 1, tasks)?;
                assert_eq!(combiner.result(), data.as_slice(), "size {size}, tasks {tasks}");
            }
        }
    }
    Ok(())
}

#[test]
fn combine_all_preserves_order_around_min_fork_size() -> Result<()> {
    let runners = [BatchRunner::inline(), pooled(3)];
    for runner in &runners {
        for size in [0usize, 9, 10, 11] {
            for tasks in 1..=4 {
                let data: Vec<u32> = (0..size as u32).collect();
                let resolved = BatchSource::from(data.clone()).resolve();
                let expected_tasks = match size {
                    0 => 0,
                    9 => 1,
                    _ => tasks,
                };
                assert_eq!(runner.plan(&resolved, 10, tasks).task_count(), expected_tasks);

                let mut recorder = Recorder::default();
                runner.run(data.clone().into(), &copy_all(), &mut recorder, 10, tasks)?;
                assert_eq!(recorder.received, expected_tasks, "size {size}, tasks {tasks}");

                let mut combiner = ListCombiner::new(false);
                runner.run(data.clone().into(), &copy_all(), &mut combiner, 10, tasks)?;
                assert_eq!(combiner.result(), data.as_slice(), "size {size}, tasks {tasks}");
            }
        }
    }
    Ok(())
}

#[test]
fn bucket_sources_keep_section_order() -> Result<()> {
    let runner = pooled(4);
    let buckets = Arc::new(Buckets::hashed(0..1_000u32, 32));
    let expected: Vec<u32> = buckets.iter().copied().collect();

    for tasks in [1, 2, 3, 5, 8, 32, 64] {
        let mut combiner = ListCombiner::new(false);
        runner.run(BatchSource::batched(Arc::clone(&buckets)), &copy_all(), &mut combiner, 1, tasks)?;
        assert_eq!(combiner.result(), expected.as_slice(), "tasks {tasks}");
    }
    Ok(())
}

#[test]
fn iterable_sources_are_materialized_once() -> Result<()> {
    let runner = pooled(2);
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let iter = (0..500u32).inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut combiner = ListCombiner::new(false);
    runner.run(BatchSource::iterable(iter), &copy_all(), &mut combiner, 1, 4)?;

    assert_eq!(pulled.load(Ordering::SeqCst), 500);
    assert_eq!(combiner.into_result(), (0..500u32).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn serial_and_parallel_runs_agree() -> Result<()> {
    let data: Vec<u32> = (0..10_000).map(|i| (i * 7919) % 1_009).collect();
    let multiples = || CountProcedure::new(|x: &u32| x % 3 == 0);

    let mut serial = CountCombiner::new();
    pooled(4).run(data.clone().into(), &multiples, &mut serial, usize::MAX, 8)?;

    let mut parallel = CountCombiner::new();
    pooled(4).run(data.clone().into(), &multiples, &mut parallel, 1, 8)?;

    assert_eq!(serial.count(), parallel.count());
    assert_eq!(serial.count(), data.iter().filter(|x| *x % 3 == 0).count());
    Ok(())
}

#[test]
fn first_task_failure_fails_the_run() {
    init_tracing();
    let runner = pooled(4);
    let factory = || {
        CountProcedure::new(|x: &u32| {
            if *x == 57 {
                panic!("bad element {x}");
            }
            true
        })
    };
    let mut recorder = Recorder::default();
    let err = runner
        .run((0..100u32).collect::<Vec<_>>().into(), &factory, &mut recorder, 1, 4)
        .unwrap_err();

    // 100 elements in 4 ranges of 25: 57 lives in batch 2
    assert_eq!(
        err,
        BatchError::TaskFailed {
            batch: 2,
            message: "bad element 57".to_string()
        }
    );
    assert_eq!(recorder.all_calls, 0);
    assert_eq!(recorder.one_calls, 0);
}

#[test]
fn serial_failure_reports_batch_zero() {
    let factory = || {
        CountProcedure::new(|x: &u32| {
            assert!(*x < 3, "too big");
            true
        })
    };
    let mut count = CountCombiner::new();
    let err = BatchRunner::inline()
        .run((0..5u32).collect::<Vec<_>>().into(), &factory, &mut count, 100, 4)
        .unwrap_err();
    assert!(matches!(err, BatchError::TaskFailed { batch: 0, .. }));
    assert_eq!(count.count(), 0);
}

#[test]
fn every_task_finishes_before_failure_is_reported() {
    let runner = pooled(4);
    let finished = Arc::new(AtomicUsize::new(0));
    let factory = {
        let finished = Arc::clone(&finished);
        move || {
            let finished = Arc::clone(&finished);
            move |x: &u32| {
                if *x == 0 {
                    panic!("first batch fails");
                }
                if *x % 10 == 9 {
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    };
    let result = runner.run((0..100u32).collect::<Vec<_>>().into(), &factory, &mut PassThruCombiner, 1, 10);
    assert!(result.is_err());
    // nine healthy batches ran to their last element
    assert_eq!(finished.load(Ordering::SeqCst), 9);
}

#[test]
fn dropped_jobs_surface_as_disconnected() {
    let runner = BatchRunner::new(Arc::new(DroppingExecutor));
    let mut count = CountCombiner::new();
    let evens = || CountProcedure::new(|x: &u32| x % 2 == 0);
    let err = runner
        .run((0..100u32).collect::<Vec<_>>().into(), &evens, &mut count, 1, 4)
        .unwrap_err();
    assert_eq!(
        err,
        BatchError::Disconnected {
            submitted: 4,
            missing: 4
        }
    );
}

#[test]
fn nested_runs_execute_serially() -> Result<()> {
    let runner = pooled(2);
    let nested_serial = Arc::new(AtomicBool::new(true));
    let inner_total = Arc::new(AtomicUsize::new(0));

    let factory = {
        let runner = runner.clone();
        let nested_serial = Arc::clone(&nested_serial);
        let inner_total = Arc::clone(&inner_total);
        move || {
            let runner = runner.clone();
            let nested_serial = Arc::clone(&nested_serial);
            let inner_total = Arc::clone(&inner_total);
            move |x: &u32| {
                assert!(inside_batch_task());
                let inner: Vec<u32> = (0..*x).collect();
                let resolved = BatchSource::from(inner.clone()).resolve();
                if !matches!(runner.plan(&resolved, 1, 4), Plan::Serial(_) | Plan::Empty) {
                    nested_serial.store(false, Ordering::SeqCst);
                }
                let everything = || CountProcedure::new(|_: &u32| true);
                let mut count = CountCombiner::new();
                if runner.run(inner.into(), &everything, &mut count, 1, 4).is_ok() {
                    inner_total.fetch_add(count.count(), Ordering::SeqCst);
                }
            }
        }
    };

    assert!(!inside_batch_task());
    runner.run((0..20u32).collect::<Vec<_>>().into(), &factory, &mut PassThruCombiner, 1, 4)?;
    assert!(!inside_batch_task());
    assert!(nested_serial.load(Ordering::SeqCst));
    assert_eq!(inner_total.load(Ordering::SeqCst), (0..20).sum::<usize>());
    Ok(())
}

#[test]
fn nested_runs_on_a_single_thread_rayon_pool_complete() -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build()?;
    let runner = BatchRunner::new(Arc::new(pool));
    let inner_total = Arc::new(AtomicUsize::new(0));

    let factory = {
        let runner = runner.clone();
        let inner_total = Arc::clone(&inner_total);
        move || {
            let runner = runner.clone();
            let inner_total = Arc::clone(&inner_total);
            move |x: &u32| {
                let everything = || CountProcedure::new(|_: &u32| true);
                let mut count = CountCombiner::new();
                // the only pool thread is busy with this task, so this run must not dispatch
                if runner.run((0..*x).collect::<Vec<_>>().into(), &everything, &mut count, 1, 4).is_ok() {
                    inner_total.fetch_add(count.count(), Ordering::SeqCst);
                }
            }
        }
    };

    runner.run((0..10u32).collect::<Vec<_>>().into(), &factory, &mut PassThruCombiner, 1, 3)?;
    assert_eq!(inner_total.load(Ordering::SeqCst), (0..10).sum::<usize>());
    Ok(())
}

#[test]
fn indexed_runs_see_absolute_indices() -> Result<()> {
    let runner = pooled(3);
    let data: Arc<dyn RandomAccess<u32>> = Arc::new((100..200u32).collect::<Vec<_>>());
    let indexed = PassThruFactory::new(Synchronized::new(IndexCheck::default()));
    runner.run_with_index(data, &indexed, &mut PassThruCombiner, 1, 6)?;

    let check = indexed.procedure().with(|c| (c.visited, c.mismatches));
    assert_eq!(check, (100, 0));
    Ok(())
}

#[derive(Default)]
struct IndexCheck {
    visited: usize,
    mismatches: usize,
}

impl IndexedProcedure<u32> for IndexCheck {
    fn value(&mut self, item: &u32, index: usize) {
        self.visited += 1;
        if *item as usize != index + 100 {
            self.mismatches += 1;
        }
    }
}

#[test]
fn plans_follow_the_sizing_rules() {
    let source: ResolvedSource<u32> = BatchSource::from((0..10u32).collect::<Vec<_>>()).resolve();
    assert_eq!(Plan::for_source(&source, 11, 4), Plan::Serial(Batch::Range { index: 0, start: 0, end: 10 }));
    assert_eq!(Plan::for_source(&source, 10, 4).task_count(), 4);
    assert_eq!(Plan::for_source(&source, 1, 64).task_count(), 10);
    assert_eq!(Plan::for_source(&source, 1, 0).task_count(), 1);

    let empty: ResolvedSource<u32> = BatchSource::from(Vec::new()).resolve();
    assert_eq!(Plan::for_source(&empty, 0, 4), Plan::Empty);

    let buckets: ResolvedSource<u32> = BatchSource::batched(Arc::new(Buckets::hashed(0..100u32, 8))).resolve();
    // target 25 per batch -> four runs of whole buckets
    assert_eq!(Plan::for_source(&buckets, 1, 4).task_count(), 4);
    // one bucket per batch
    assert_eq!(Plan::for_source(&buckets, 1, 100).task_count(), 8);
}

#[test]
fn inline_runner_is_deterministic() -> Result<()> {
    let runner = BatchRunner::new(Arc::new(InlineExecutor));
    let mut combiner = ListCombiner::new(true);
    runner.run((0..50u32).collect::<Vec<_>>().into(), &copy_all(), &mut combiner, 1, 5)?;
    // completion order equals submission order on the calling thread
    assert_eq!(combiner.into_result(), (0..50u32).collect::<Vec<_>>());
    Ok(())
}
