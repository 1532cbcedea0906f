//! Throughput benchmarks for pullflow pipeline stages

use std::hint;
use std::path::Path;
use std::time::{Duration, Instant};

use pullflow_cache::{CacheStore, Fingerprint};
use pullflow_core::prelude::*;
use pullflow_parallel::{OutputOrder, ParallelMap, Prefetch};
use tracing::debug;

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Elements pulled through the pipeline per iteration
    pub elements: u64,

    /// Simulated CPU cost of mapping one element
    pub work_per_element: Duration,

    /// Pool size for parallel map benchmarks
    pub workers: usize,

    /// Lookahead for prefetch benchmarks
    pub prefetch_depth: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            elements: 2_000,
            work_per_element: Duration::from_micros(50),
            workers: 4,
            prefetch_depth: 16,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (elements/second)
    pub throughput: f64,
}

/// Run a benchmark
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, func: F) -> Result<BenchResult>
where
    F: Fn() -> Result<()>,
{
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let iterations = config.iterations.max(1);
    let mut times = Vec::with_capacity(iterations);
    let start_total = Instant::now();
    for _ in 0..iterations {
        let start = Instant::now();
        func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / u32::try_from(times.len()).unwrap_or(u32::MAX);
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    #[allow(clippy::cast_precision_loss)]
    let throughput = (config.elements as f64 * iterations as f64) / total_time.as_secs_f64();

    debug!(name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// Spin for `cost` to stand in for real per-element work
pub fn simulate_work(x: u64, cost: Duration) -> u64 {
    let start = Instant::now();
    while start.elapsed() < cost {
        hint::spin_loop();
    }
    hint::black_box(x.wrapping_mul(2_654_435_761))
}

/// Map on the consumer thread
pub fn bench_sequential_map(config: &BenchConfig) -> Result<BenchResult> {
    let cost = config.work_per_element;
    run_benchmark("Sequential Map", config, || {
        Pipeline::from_iter(0..config.elements)
            .then(Map::new(move |x| simulate_work(x, cost)))
            .drain(Consume::new())
    })
}

/// Map on the consumer thread with the upstream prefetched
pub fn bench_prefetch(config: &BenchConfig) -> Result<BenchResult> {
    let cost = config.work_per_element;
    let depth = config.prefetch_depth;
    run_benchmark("Prefetch + Map", config, || {
        Pipeline::from_iter(0..config.elements)
            .then(Map::new(move |x| simulate_work(x, cost / 2)))
            .then(Prefetch::new(depth)?)
            .then(Map::new(move |x| simulate_work(x, cost / 2)))
            .drain(Consume::new())
    })
}

/// Map on a thread pool
pub fn bench_parallel_map(config: &BenchConfig, order: OutputOrder) -> Result<BenchResult> {
    let cost = config.work_per_element;
    let name = match order {
        OutputOrder::Preserve => "ParallelMap (ordered)",
        OutputOrder::FirstAvailable => "ParallelMap (first available)",
    };
    run_benchmark(name, config, || {
        Pipeline::from_iter(0..config.elements)
            .then(ParallelMap::new(move |x| simulate_work(x, cost)).workers(config.workers).order(order))
            .drain(Consume::new())
    })
}

/// Replay a committed cache entry instead of mapping
pub fn bench_cache_replay(config: &BenchConfig, root: &Path) -> Result<BenchResult> {
    let store = CacheStore::open(root)?;
    let fingerprint = Fingerprint::builder("bench").version(1).input(&config.elements)?.build::<u64>();
    let cost = config.work_per_element;
    let compute = || {
        Pipeline::from_iter(0..config.elements)
            .then(Map::new(move |x| simulate_work(x, cost)))
            .then(store.stage(fingerprint))
            .drain(Consume::new())
    };
    // First pass commits the entry.
    compute()?;
    run_benchmark("Cache replay", config, compute)
}

/// Run every strategy with the same configuration
pub fn compare_strategies(config: &BenchConfig, cache_root: &Path) -> Result<Vec<BenchResult>> {
    Ok(vec![
        bench_sequential_map(config)?,
        bench_prefetch(config)?,
        bench_parallel_map(config, OutputOrder::Preserve)?,
        bench_parallel_map(config, OutputOrder::FirstAvailable)?,
        bench_cache_replay(config, cache_root)?,
    ])
}
