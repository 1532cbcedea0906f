//! Parallel map over a fixed worker pool
//!
//! The consumer thread pulls the upstream itself and hands elements to a pool
//! of `P` workers, keeping at most `P` elements between the upstream and the
//! consumer at any time. Results are either released in input order through a
//! reorder buffer or as soon as they complete.
//!
//! The pool is started on the first pull and torn down when the sequence is
//! exhausted, closed or dropped. Teardown discards queued tasks, waits for the
//! tasks already running and joins every worker thread.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace};

use pullflow_core::{Error, Fuse, Result, Sequence, StageConfig, Transform};

use crate::process::{ProcessCommand, ProcessSpawner};
use crate::worker::{ExecutionMode, Fallible, Infallible, ThreadSpawner, Worker, WorkerSpawner};

/// Prefix of pool thread names; the worker id is appended
pub const MAP_THREAD_PREFIX: &str = "pullflow-map-";

/// Order in which mapped results are released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputOrder {
    /// Input order, through a reorder buffer
    #[default]
    Preserve,

    /// Completion order
    FirstAvailable,
}

impl From<bool> for OutputOrder {
    fn from(ordered: bool) -> Self {
        if ordered {
            OutputOrder::Preserve
        } else {
            OutputOrder::FirstAvailable
        }
    }
}

/// Map elements on a pool of threads or worker processes
///
/// ```
/// use pullflow_core::prelude::*;
/// use pullflow_parallel::ParallelMap;
///
/// let squares = Pipeline::from_iter(1..=5)
///     .then(ParallelMap::new(|x: i32| x * x).workers(3))
///     .drain(Collect::new())?;
/// assert_eq!(squares, vec![1, 4, 9, 16, 25]);
/// # Ok::<(), pullflow_core::Error>(())
/// ```
pub struct ParallelMap<S> {
    spawner: S,
    workers: usize,
    order: OutputOrder,
}

impl<F> ParallelMap<ThreadSpawner<Infallible<F>>> {
    /// Map with a function that cannot fail
    ///
    /// A panic inside `func` fails only the element being mapped.
    pub fn new(func: F) -> Self {
        Self::with_spawner(ThreadSpawner::new(Infallible(func)))
    }

    /// Map with `func`, sized and ordered from `config`
    pub fn from_config(func: F, config: &StageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(func).with_config(config))
    }
}

impl<F> ParallelMap<ThreadSpawner<Fallible<F>>> {
    /// Map with a function returning [`Result`]; an `Err` fails that slot
    pub fn try_new(func: F) -> Self {
        Self::with_spawner(ThreadSpawner::new(Fallible(func)))
    }
}

impl<O> ParallelMap<ProcessSpawner<O>> {
    /// Map by forwarding elements to `P` long-lived child processes
    pub fn process(command: ProcessCommand) -> Self {
        Self::with_spawner(ProcessSpawner::new(command))
    }
}

impl<S> ParallelMap<S> {
    /// Map with workers from a custom spawner
    pub fn with_spawner(spawner: S) -> Self {
        Self {
            spawner,
            workers: num_cpus::get(),
            order: OutputOrder::Preserve,
        }
    }

    /// Set the pool size; zero is reported on the first pull
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Preserve input order (`true`) or release in completion order (`false`)
    #[must_use]
    pub fn ordered(self, ordered: bool) -> Self {
        self.order(OutputOrder::from(ordered))
    }

    /// Set the release order
    #[must_use]
    pub fn order(mut self, order: OutputOrder) -> Self {
        self.order = order;
        self
    }

    /// Apply the `workers` and `ordered` options
    #[must_use]
    pub fn with_config(mut self, config: &StageConfig) -> Self {
        if let Some(workers) = config.workers {
            self.workers = workers;
        }
        self.order = OutputOrder::from(config.ordered);
        self
    }

    /// Configured pool size
    pub fn pool_size(&self) -> usize {
        self.workers
    }

    /// Configured release order
    pub fn output_order(&self) -> OutputOrder {
        self.order
    }

    /// Whether this stage maps on threads or child processes
    pub fn mode<T>(&self) -> ExecutionMode
    where
        S: WorkerSpawner<T>,
    {
        self.spawner.mode()
    }
}

impl<I, S> Transform<I> for ParallelMap<S>
where
    I: Sequence,
    I::Item: Send + 'static,
    S: WorkerSpawner<I::Item>,
{
    type Output = ParallelMapSequence<I, S>;

    fn apply(self, input: I) -> Self::Output {
        ParallelMapSequence {
            input: Fuse::new(input),
            state: State::Pending(self.spawner),
            workers: self.workers,
            order: self.order,
            next_index: 0,
            next_release: 0,
            in_flight: 0,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
        }
    }
}

/// A task handed to the pool: position and element
type Task<T> = (u64, T);

/// A finished task: position and outcome
type Done<O> = (u64, Result<O>);

/// Worker threads and the channels that feed them
struct Pool<T, O> {
    tasks: Option<Sender<Task<T>>>,
    results: Receiver<Done<O>>,
    cancelled: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static, O: Send + 'static> Pool<T, O> {
    fn start<S>(spawner: &S, workers: usize) -> Result<Self>
    where
        S: WorkerSpawner<T, Output = O>,
    {
        let (task_tx, task_rx) = unbounded::<Task<T>>();
        let (result_tx, result_rx) = unbounded::<Done<O>>();
        let mut pool = Pool {
            tasks: Some(task_tx),
            results: result_rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(workers),
        };
        // On any failure below, dropping `pool` joins the workers started so far.
        for id in 0..workers {
            let worker = spawner.spawn(id)?;
            let tasks = task_rx.clone();
            let results = result_tx.clone();
            let cancelled = Arc::clone(&pool.cancelled);
            let handle = thread::Builder::new()
                .name(format!("{MAP_THREAD_PREFIX}{id}"))
                .spawn(move || run_worker(id, worker, &tasks, &results, &cancelled))?;
            pool.handles.push(handle);
        }
        debug!(workers, mode = ?spawner.mode(), "parallel map pool started");
        Ok(pool)
    }
}

impl<T, O> Pool<T, O> {
    fn submit(&self, task: Task<T>) -> Result<()> {
        match &self.tasks {
            Some(tasks) => tasks.send(task).map_err(|_| Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }
}

impl<T, O> Drop for Pool<T, O> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.tasks.take();
        let workers = self.handles.len();
        for handle in self.handles.drain(..) {
            // Panics inside a worker are caught per task; a join error here
            // can only come from a worker's own teardown.
            if handle.join().is_err() {
                debug!("parallel map worker panicked during teardown");
            }
        }
        debug!(workers, "parallel map pool joined");
    }
}

fn run_worker<T, W>(id: usize, mut worker: W, tasks: &Receiver<Task<T>>, results: &Sender<Done<W::Output>>, cancelled: &AtomicBool)
where
    W: Worker<T>,
{
    while let Ok((index, item)) = tasks.recv() {
        if cancelled.load(Ordering::SeqCst) {
            // Drain and discard what is still queued.
            continue;
        }
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker.call(item))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Error::from_panic(payload.as_ref())),
        };
        trace!(worker = id, index, ok = outcome.is_ok(), "task finished");
        if results.send((index, outcome)).is_err() {
            break;
        }
    }
}

enum State<S, T, O> {
    /// Not pulled yet; no worker exists
    Pending(S),

    /// Pool running
    Running(Pool<T, O>),

    /// Every result released, or the pool could not start
    Finished,
}

/// Sequence produced by [`ParallelMap`]
pub struct ParallelMapSequence<I, S>
where
    I: Sequence,
    S: WorkerSpawner<I::Item>,
{
    input: Fuse<I>,
    state: State<S, I::Item, S::Output>,
    workers: usize,
    order: OutputOrder,

    /// Position given to the next upstream slot
    next_index: u64,

    /// Position the reorder buffer releases next
    next_release: u64,

    /// Tasks submitted and not yet returned
    in_flight: usize,

    /// Finished results waiting for earlier positions
    reorder: BTreeMap<u64, Result<S::Output>>,

    /// Finished results in completion order
    ready: VecDeque<Result<S::Output>>,
}

impl<I, S> ParallelMapSequence<I, S>
where
    I: Sequence,
    I::Item: Send + 'static,
    S: WorkerSpawner<I::Item>,
{
    /// Elements scheduled and not yet released: running plus buffered
    pub fn pending(&self) -> usize {
        self.in_flight + self.reorder.len() + self.ready.len()
    }

    /// Tasks currently submitted to the pool
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the worker pool currently exists
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Tear the pool and the upstream down now; later pulls report end of sequence
    pub fn close(&mut self) {
        self.state = State::Finished;
        self.input.close();
        self.reorder.clear();
        self.ready.clear();
        self.in_flight = 0;
    }

    fn start(&mut self) -> Result<()> {
        let State::Pending(spawner) = std::mem::replace(&mut self.state, State::Finished) else {
            return Ok(());
        };
        if self.workers == 0 {
            self.input.close();
            return Err(Error::InvalidArgument("parallel map needs at least one worker".into()));
        }
        match Pool::start(&spawner, self.workers) {
            Ok(pool) => {
                self.state = State::Running(pool);
                Ok(())
            }
            Err(err) => {
                self.input.close();
                Err(err)
            }
        }
    }

    /// Pull the upstream until the window is full or the upstream ends
    fn fill_window(&mut self) -> Result<()> {
        let State::Running(pool) = &self.state else {
            return Ok(());
        };
        while !self.input.is_exhausted() && self.in_flight + self.reorder.len() + self.ready.len() < self.workers {
            let index = self.next_index;
            match self.input.next_item() {
                Ok(Some(item)) => {
                    pool.submit((index, item))?;
                    self.in_flight += 1;
                }
                Ok(None) => break,
                Err(err) => match self.order {
                    OutputOrder::Preserve => {
                        self.reorder.insert(index, Err(err));
                    }
                    OutputOrder::FirstAvailable => self.ready.push_back(Err(err)),
                },
            }
            self.next_index += 1;
        }
        Ok(())
    }

    fn release(&mut self) -> Option<Result<S::Output>> {
        match self.order {
            OutputOrder::Preserve => {
                let slot = self.reorder.remove(&self.next_release)?;
                self.next_release += 1;
                Some(slot)
            }
            OutputOrder::FirstAvailable => self.ready.pop_front(),
        }
    }

    fn finish(&mut self) {
        debug!(produced = self.next_index, "parallel map finished");
        self.state = State::Finished;
        self.input.close();
    }
}

impl<I, S> Sequence for ParallelMapSequence<I, S>
where
    I: Sequence,
    I::Item: Send + 'static,
    S: WorkerSpawner<I::Item>,
{
    type Item = S::Output;

    fn next_item(&mut self) -> Result<Option<S::Output>> {
        if matches!(self.state, State::Pending(_)) {
            self.start()?;
        }
        loop {
            if !matches!(self.state, State::Running(_)) {
                return Ok(None);
            }
            self.fill_window()?;
            if let Some(slot) = self.release() {
                return slot.map(Some);
            }
            if self.in_flight == 0 {
                // Nothing running and nothing releasable: every slot is out.
                self.finish();
                return Ok(None);
            }
            let State::Running(pool) = &self.state else {
                return Ok(None);
            };
            match pool.results.recv() {
                Ok((index, outcome)) => {
                    self.in_flight -= 1;
                    match self.order {
                        OutputOrder::Preserve => {
                            self.reorder.insert(index, outcome);
                        }
                        OutputOrder::FirstAvailable => self.ready.push_back(outcome),
                    }
                }
                Err(_) => {
                    self.close();
                    return Err(Error::Disconnected);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.state {
            State::Finished => (0, Some(0)),
            _ => {
                let pending = self.pending();
                let (lower, upper) = self.input.size_hint();
                (lower.saturating_add(pending), upper.and_then(|u| u.checked_add(pending)))
            }
        }
    }
}
