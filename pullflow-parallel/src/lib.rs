//! Concurrency-bearing stages for pullflow pipelines
//!
//! [`Prefetch`] moves the upstream onto one background thread behind a
//! bounded queue. [`ParallelMap`] fans elements out to a pool of threads or
//! child processes. Both start their workers on the first pull and join them
//! before they are dropped, so no thread outlives the pipeline.

#![warn(missing_docs)]

pub mod parallel_map;
pub mod prefetch;
pub mod process;
pub mod worker;

pub use parallel_map::{OutputOrder, ParallelMap, ParallelMapSequence, MAP_THREAD_PREFIX};
pub use prefetch::{Prefetch, PrefetchSequence, PREFETCH_THREAD_NAME};
pub use process::{ProcessCommand, ProcessSpawner, ProcessWorker};
pub use worker::{ExecutionMode, Fallible, Infallible, MapFn, ThreadSpawner, ThreadWorker, Worker, WorkerSpawner};
