//! Executors and the bounded caller-runs worker pool.
//!
//! The runner only needs somewhere to send boxed jobs: anything implementing
//! [`Executor`] will do. Three are provided:
//!
//! - [`WorkerPool`]: a named, bounded pool. Jobs are handed to idle workers through a
//!   zero-capacity channel; when every worker is busy and the pool is at capacity the
//!   submitting thread runs the job itself (caller-runs). Nothing is ever queued.
//! - [`InlineExecutor`]: runs every job on the submitting thread. Deterministic, for tests.
//! - [`rayon::ThreadPool`]: jobs are `spawn`ed onto the rayon pool.
//!
//! A process-wide pool is available through [`default_pool`]. It is created on first
//! use and released with [`shutdown_default_pool`].

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

use crate::error::panic_message;
use crate::sizing::default_max_pool_size;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run jobs.
///
/// Implementations must eventually run or drop every job they accept. The runner
/// tolerates a dropped job (it reports [`BatchError::Disconnected`](crate::BatchError))
/// but never waits on one forever.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs each job immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Jobs go to [`rayon::ThreadPool::spawn`].
///
/// The runner blocks its calling thread until every task reports and does not
/// help with the work. Do not start a run from one of this pool's own threads
/// (outside a batch task, where nested runs already go serial): with every
/// thread waiting, the tasks never get a thread and the run deadlocks. A
/// one-thread pool deadlocks on the first such run.
impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job);
    }
}

/// Name of the process-wide pool.
pub const DEFAULT_POOL_NAME: &str = "ironbatch";

static DEFAULT_POOL: Mutex<Option<Arc<WorkerPool>>> = parking_lot::const_mutex(None);

/// The process-wide pool, created on first use.
///
/// Sized to [`default_max_pool_size`] with daemon workers. If the previous default
/// pool was shut down, a fresh one replaces it.
pub fn default_pool() -> Arc<WorkerPool> {
    let mut slot = DEFAULT_POOL.lock();
    match slot.as_ref() {
        Some(pool) if !pool.is_shutdown() => Arc::clone(pool),
        _ => {
            let pool = Arc::new(WorkerPool::new(
                DEFAULT_POOL_NAME,
                default_max_pool_size(),
                true,
            ));
            *slot = Some(Arc::clone(&pool));
            pool
        }
    }
}

/// Shut down the process-wide pool, if one was created.
pub fn shutdown_default_pool() {
    if let Some(pool) = DEFAULT_POOL.lock().take() {
        pool.shutdown();
    }
}

#[derive(Default)]
struct PoolStats {
    spawned: AtomicUsize,
    handoffs: AtomicUsize,
    caller_runs: AtomicUsize,
}

struct PoolState {
    sender: Option<Sender<Job>>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
}

/// A bounded pool of named threads with a caller-runs saturation policy.
///
/// Workers are spawned on demand up to `size` and live until [`shutdown`](Self::shutdown).
/// Jobs submitted after shutdown run on the submitting thread.
pub struct WorkerPool {
    name: String,
    size: usize,
    daemon: bool,
    state: Mutex<PoolState>,
    stats: PoolStats,
}

impl WorkerPool {
    /// A pool of at most `size` threads named `{name}-{n}`.
    ///
    /// Non-daemon pools join their workers when dropped; daemon pools detach them.
    pub fn new(name: impl Into<String>, size: usize, daemon: bool) -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            name: name.into(),
            size: size.max(1),
            daemon,
            state: Mutex::new(PoolState {
                sender: Some(sender),
                receiver,
                workers: Vec::new(),
            }),
            stats: PoolStats::default(),
        }
    }

    /// A daemon pool sized like the default pool.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(name, default_max_pool_size(), true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Worker threads started so far.
    pub fn spawned(&self) -> usize {
        self.stats.spawned.load(Ordering::Relaxed)
    }

    /// Jobs handed to an idle worker.
    pub fn handoffs(&self) -> usize {
        self.stats.handoffs.load(Ordering::Relaxed)
    }

    /// Jobs the submitting thread ran itself.
    pub fn caller_runs(&self) -> usize {
        self.stats.caller_runs.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().sender.is_none()
    }

    /// Stop accepting work. Workers exit once idle; running jobs finish.
    pub fn shutdown(&self) {
        if self.state.lock().sender.take().is_some() {
            debug!(pool = %self.name, "worker pool shut down");
        }
    }

    /// Shut down and wait for every worker thread to exit.
    pub fn shutdown_and_join(&self) {
        self.shutdown();
        self.join_workers();
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut self.state.lock().workers);
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "worker thread exited with a panic");
            }
        }
    }

    fn run_on_caller(&self, job: Job) {
        self.stats.caller_runs.fetch_add(1, Ordering::Relaxed);
        job();
    }

    /// Start a worker whose first job is `job`. Gives the job back if the OS refuses.
    fn spawn_worker(&self, state: &mut PoolState, job: Job) -> Result<(), Job> {
        let id = state.workers.len();
        let first = Arc::new(Mutex::new(Some(job)));
        let worker_first = Arc::clone(&first);
        let receiver = state.receiver.clone();
        let name = format!("{}-{}", self.name, id);

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let job = worker_first.lock().take();
            drop(worker_first);
            if let Some(job) = job {
                run_guarded(job);
            }
            while let Ok(job) = receiver.recv() {
                run_guarded(job);
            }
            trace!(worker = %name, "worker exiting");
        });

        match spawned {
            Ok(handle) => {
                state.workers.push(handle);
                self.stats.spawned.fetch_add(1, Ordering::Relaxed);
                trace!(pool = %self.name, worker = id, "spawned worker");
                Ok(())
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "failed to spawn worker thread");
                match first.lock().take() {
                    Some(job) => Err(job),
                    None => Ok(()),
                }
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.as_ref() else {
            drop(state);
            warn!(pool = %self.name, "job submitted after shutdown; running on caller");
            self.run_on_caller(job);
            return;
        };

        let job = match sender.try_send(job) {
            Ok(()) => {
                self.stats.handoffs.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job,
        };

        if state.workers.len() < self.size {
            match self.spawn_worker(&mut state, job) {
                Ok(()) => return,
                Err(job) => {
                    drop(state);
                    self.run_on_caller(job);
                    return;
                }
            }
        }

        drop(state);
        self.run_on_caller(job);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        if !self.daemon {
            self.join_workers();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("daemon", &self.daemon)
            .field("spawned", &self.spawned())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Run a job, keeping the worker alive if it panics.
fn run_guarded(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        warn!(message = %panic_message(payload.as_ref()), "job panicked on worker thread");
    }
}
