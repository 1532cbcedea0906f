//! Worker abstraction shared by the parallel map execution modes
//!
//! A [`WorkerSpawner`] is asked for one [`Worker`] per pool thread when the
//! pool starts. Each pool thread owns its worker for the lifetime of the
//! pool and feeds it one element at a time. Panics raised by a worker are
//! caught by the pool and fail only the element being mapped.

use std::sync::Arc;

use pullflow_core::Result;

/// How the parallel map performs its work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Call a shared function on pool threads
    Threads,

    /// Forward elements to long-lived child processes
    Processes,
}

/// Per-thread handle that maps one element at a time
pub trait Worker<I>: Send {
    /// Mapped element type
    type Output;

    /// Map a single element; an `Err` fails that element's slot only
    fn call(&mut self, input: I) -> Result<Self::Output>;
}

/// Factory for the workers of a pool
pub trait WorkerSpawner<I>: Send {
    /// Mapped element type
    type Output: Send + 'static;

    /// Worker handed to each pool thread
    type Worker: Worker<I, Output = Self::Output> + 'static;

    /// Execution mode of the workers this spawner creates
    fn mode(&self) -> ExecutionMode;

    /// Create the worker for pool thread `id`
    fn spawn(&self, id: usize) -> Result<Self::Worker>;
}

/// A mapping function callable from several threads at once
pub trait MapFn<I>: Send + Sync + 'static {
    /// Mapped element type
    type Output;

    /// Map one element
    fn call(&self, input: I) -> Result<Self::Output>;
}

/// Adapter for functions that cannot fail
pub struct Infallible<F>(pub F);

impl<I, O, F> MapFn<I> for Infallible<F>
where
    F: Fn(I) -> O + Send + Sync + 'static,
{
    type Output = O;

    fn call(&self, input: I) -> Result<O> {
        Ok((self.0)(input))
    }
}

/// Adapter for functions returning [`Result`]
pub struct Fallible<F>(pub F);

impl<I, O, F> MapFn<I> for Fallible<F>
where
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
{
    type Output = O;

    fn call(&self, input: I) -> Result<O> {
        (self.0)(input)
    }
}

/// Spawns workers that share one function across pool threads
pub struct ThreadSpawner<M> {
    func: Arc<M>,
}

impl<M> ThreadSpawner<M> {
    /// Wrap a mapping function
    pub fn new(func: M) -> Self {
        Self { func: Arc::new(func) }
    }
}

impl<I, M> WorkerSpawner<I> for ThreadSpawner<M>
where
    M: MapFn<I>,
    M::Output: Send + 'static,
{
    type Output = M::Output;
    type Worker = ThreadWorker<M>;

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Threads
    }

    fn spawn(&self, _id: usize) -> Result<Self::Worker> {
        Ok(ThreadWorker {
            func: Arc::clone(&self.func),
        })
    }
}

/// Worker calling the shared function of a [`ThreadSpawner`]
pub struct ThreadWorker<M> {
    func: Arc<M>,
}

impl<I, M> Worker<I> for ThreadWorker<M>
where
    M: MapFn<I>,
{
    type Output = M::Output;

    fn call(&mut self, input: I) -> Result<M::Output> {
        self.func.call(input)
    }
}
