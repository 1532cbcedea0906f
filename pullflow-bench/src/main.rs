//! Benchmark runner comparing pullflow execution strategies

use std::time::Duration;

use anyhow::Context;
use pullflow_bench::{compare_strategies, BenchConfig, BenchResult};
use tracing_subscriber::EnvFilter;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} elements/sec", result.throughput);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== pullflow Benchmarks ===");

    let cache_dir = tempfile::tempdir().context("creating cache directory")?;
    let config = BenchConfig::default();
    for result in compare_strategies(&config, cache_dir.path()).context("running strategy comparison")? {
        print_result(&result);
    }

    println!("\n=== Parallel Map Scaling ===");
    for workers in [1, 2, 4, 8] {
        let config = BenchConfig {
            iterations: 3,
            warmup_iterations: 1,
            workers,
            ..BenchConfig::default()
        };
        let result = pullflow_bench::bench_parallel_map(&config, pullflow_parallel::OutputOrder::Preserve)
            .with_context(|| format!("parallel map with {workers} workers"))?;
        println!("\nWorkers: {workers}");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} elements/sec", result.throughput);
    }

    println!("\n=== Prefetch Depth ===");
    for prefetch_depth in [1, 4, 16, 64] {
        let config = BenchConfig {
            iterations: 3,
            warmup_iterations: 1,
            prefetch_depth,
            work_per_element: Duration::from_micros(20),
            ..BenchConfig::default()
        };
        let result = pullflow_bench::bench_prefetch(&config).with_context(|| format!("prefetch depth {prefetch_depth}"))?;
        println!("\nDepth: {prefetch_depth}");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} elements/sec", result.throughput);
    }

    Ok(())
}
