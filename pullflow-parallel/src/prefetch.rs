//! Background prefetching of an upstream sequence
//!
//! One worker thread pulls the upstream into a bounded FIFO queue so the
//! consumer only waits when the producer has fallen behind. The worker is
//! started on the first pull and always joined before the sequence is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use pullflow_core::{Error, Result, Sequence, StageConfig, Transform};

/// Name given to prefetch worker threads
pub const PREFETCH_THREAD_NAME: &str = "pullflow-prefetch";

/// Decouple producer throughput from consumer pull rate
///
/// ```
/// use pullflow_core::prelude::*;
/// use pullflow_parallel::Prefetch;
///
/// let out = Pipeline::from_iter(0..5)
///     .then(Prefetch::new(2)?)
///     .drain(Collect::new())?;
/// assert_eq!(out, vec![0, 1, 2, 3, 4]);
/// # Ok::<(), pullflow_core::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Prefetch {
    /// Maximum number of undelivered elements held in the queue
    depth: usize,
}

impl Prefetch {
    /// Create a prefetch stage with lookahead `depth`, which must be at least 1
    pub fn new(depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidArgument("prefetch depth must be at least 1".into()));
        }
        Ok(Self { depth })
    }

    /// Create a prefetch stage from the `prefetch_depth` option
    pub fn from_config(config: &StageConfig) -> Result<Self> {
        Self::new(config.prefetch_depth)
    }

    /// Lookahead depth
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Default for Prefetch {
    fn default() -> Self {
        Self { depth: 1 }
    }
}

impl<I> Transform<I> for Prefetch
where
    I: Sequence + 'static,
    I::Item: Send + 'static,
{
    type Output = PrefetchSequence<I>;

    fn apply(self, input: I) -> Self::Output {
        PrefetchSequence {
            state: State::Pending(input),
            depth: self.depth,
        }
    }
}

enum State<I: Sequence> {
    /// Not pulled yet; no thread exists
    Pending(I),

    /// Worker running
    Running(Producer<I::Item>),

    /// Exhausted, failed to start, or closed
    Finished,
}

/// Handle on the background worker
struct Producer<T> {
    /// Consumer end of the queue; `None` once dropped for shutdown
    queue: Option<Receiver<Result<T>>>,

    /// Tells the worker to stop before its next pull
    stop: Arc<AtomicBool>,

    /// Worker thread; `None` once joined
    handle: Option<JoinHandle<()>>,
}

impl<T> Producer<T> {
    /// Stop the worker and wait for it. Returns the panic, if the worker had one.
    fn shutdown(&mut self) -> Option<Error> {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the receiver unblocks a worker waiting on a full queue.
        self.queue.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(()) => {
                trace!("prefetch worker joined");
                None
            }
            Err(payload) => Some(Error::from_panic(payload.as_ref())),
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        if let Some(err) = self.shutdown() {
            warn!(error = %err, "prefetch worker panicked during shutdown");
        }
    }
}

/// Sequence produced by [`Prefetch`]
pub struct PrefetchSequence<I: Sequence> {
    state: State<I>,
    depth: usize,
}

impl<I> PrefetchSequence<I>
where
    I: Sequence + 'static,
    I::Item: Send + 'static,
{
    /// Number of elements waiting in the queue, never more than the depth
    pub fn buffered(&self) -> usize {
        match &self.state {
            State::Running(producer) => producer.queue.as_ref().map_or(0, Receiver::len),
            _ => 0,
        }
    }

    /// Whether a background worker currently exists
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Stop the worker now and join it; later pulls report end of sequence
    pub fn close(&mut self) {
        self.state = State::Finished;
    }

    fn start(&mut self) -> Result<()> {
        let State::Pending(input) = std::mem::replace(&mut self.state, State::Finished) else {
            return Ok(());
        };
        let (tx, rx) = bounded(self.depth);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(PREFETCH_THREAD_NAME.to_string())
            .spawn(move || produce(input, &tx, &worker_stop))?;
        debug!(depth = self.depth, "prefetch worker started");
        self.state = State::Running(Producer {
            queue: Some(rx),
            stop,
            handle: Some(handle),
        });
        Ok(())
    }
}

fn produce<I: Sequence>(mut input: I, queue: &Sender<Result<I::Item>>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let slot = match input.next_item() {
            Ok(Some(item)) => Ok(item),
            Ok(None) => break,
            Err(err) => Err(err),
        };
        if queue.send(slot).is_err() {
            // Consumer is gone.
            break;
        }
    }
}

impl<I> Sequence for PrefetchSequence<I>
where
    I: Sequence + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        if matches!(self.state, State::Pending(_)) {
            self.start()?;
        }
        let State::Running(producer) = &mut self.state else {
            return Ok(None);
        };
        let received = match producer.queue.as_ref() {
            Some(queue) => queue.recv(),
            None => return Ok(None),
        };
        match received {
            Ok(slot) => slot.map(Some),
            Err(_) => {
                // The worker dropped its sender: upstream ended or the worker panicked.
                let panicked = producer.shutdown();
                self.state = State::Finished;
                match panicked {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.state {
            State::Pending(input) => input.size_hint(),
            State::Running(_) => (self.buffered(), None),
            State::Finished => (0, Some(0)),
        }
    }
}
