//! Bench command - measure launch latency, optionally with several
//! contexts running concurrently on their own streams.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use leanrt_core::{AllocationStrategy, Stream};

use super::run::StrategyArg;
use super::{LoadedEngine, bind_io, load_config, load_engine, parse_shape};

/// Arguments for the bench command.
#[derive(Args)]
pub struct BenchArgs {
    /// Engine file
    #[arg(required = true)]
    engine: PathBuf,

    /// Timed launches per context
    #[arg(short = 'n', long, default_value = "100")]
    iterations: usize,

    /// Untimed launches per context before measuring
    #[arg(short, long, default_value = "10")]
    warmup: usize,

    /// Number of contexts running in parallel, one stream each
    #[arg(short = 'j', long, default_value = "1")]
    jobs: usize,

    /// Input shape as NAME=DxD; may be repeated
    #[arg(short, long = "shape", value_parser = parse_shape)]
    shapes: Vec<(String, Vec<i64>)>,

    /// Optimization profile
    #[arg(short, long, default_value = "0")]
    profile: usize,

    /// Activation memory strategy (default: from config)
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,
}

/// Latency summary of a set of launches.
#[derive(Debug, PartialEq)]
struct Stats {
    count: usize,
    mean: Duration,
    min: Duration,
    p50: Duration,
    p99: Duration,
    max: Duration,
}

impl Stats {
    fn from_samples(mut samples: Vec<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let count = samples.len();
        let total: Duration = samples.iter().sum();
        let percentile = |q: f64| samples[((count - 1) as f64 * q).round() as usize];
        Some(Self {
            count,
            mean: total / count as u32,
            min: samples[0],
            p50: percentile(0.5),
            p99: percentile(0.99),
            max: samples[count - 1],
        })
    }
}

pub async fn run(args: BenchArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    if args.jobs == 0 {
        anyhow::bail!("--jobs must be at least 1");
    }

    let config = load_config(config_path)?;
    let strategy = args
        .strategy
        .map(AllocationStrategy::from)
        .unwrap_or(config.context.default_strategy);
    if strategy == AllocationStrategy::UserManaged {
        anyhow::bail!("The user_managed strategy needs caller memory; use --strategy static");
    }

    let loaded = Arc::new(load_engine(&args.engine, config)?);
    let shapes: Arc<HashMap<String, Vec<i64>>> = Arc::new(args.shapes.iter().cloned().collect());

    println!(
        "{} Benchmarking '{}': {} context(s) x {} launches",
        style("ℹ").blue(),
        loaded.engine.name(),
        args.jobs,
        args.iterations
    );

    let pb = ProgressBar::new((args.jobs * args.iterations) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} launches")?
            .progress_chars("=>-"),
    );

    let start = Instant::now();
    let handles: Vec<_> = (0..args.jobs)
        .map(|job| {
            let loaded = Arc::clone(&loaded);
            let shapes = Arc::clone(&shapes);
            let pb = pb.clone();
            let (profile, warmup, iterations) = (args.profile, args.warmup, args.iterations);
            tokio::task::spawn_blocking(move || {
                bench_context(&loaded, strategy, profile, &shapes, warmup, iterations, &pb)
                    .map_err(|e| anyhow::anyhow!("context {}: {}", job, e))
            })
        })
        .collect();

    let mut samples = Vec::with_capacity(args.jobs * args.iterations);
    for handle in handles {
        samples.extend(handle.await??);
    }
    let wall = start.elapsed();
    pb.finish_with_message("Complete");

    let Some(stats) = Stats::from_samples(samples) else {
        println!("{} No launches measured", style("ℹ").blue());
        return Ok(());
    };
    info!("Measured {} launches in {:?}", stats.count, wall);

    println!();
    println!(
        "{} {} launches in {:?} ({:.1} launches/s)",
        style("✓").green(),
        stats.count,
        wall,
        stats.count as f64 / wall.as_secs_f64()
    );
    println!(
        "   mean {:?}  min {:?}  p50 {:?}  p99 {:?}  max {:?}",
        stats.mean, stats.min, stats.p50, stats.p99, stats.max
    );

    Ok(())
}

/// Run `warmup` untimed and `iterations` timed launches on a fresh context
/// and stream, returning the latency of each timed launch.
fn bench_context(
    loaded: &LoadedEngine,
    strategy: AllocationStrategy,
    profile: usize,
    shapes: &HashMap<String, Vec<i64>>,
    warmup: usize,
    iterations: usize,
    pb: &ProgressBar,
) -> anyhow::Result<Vec<Duration>> {
    let engine = &loaded.engine;
    let mut context = engine
        .create_execution_context(strategy)
        .ok_or_else(|| anyhow::anyhow!("failed to create an execution context"))?;
    if !context.set_optimization_profile(profile) {
        anyhow::bail!("profile {} out of range", profile);
    }
    let _tensors = bind_io(engine, &mut context, shapes, &HashMap::new())?;
    let stream = Stream::new()?;

    let mut launch = || -> anyhow::Result<Duration> {
        let start = Instant::now();
        // SAFETY: `_tensors` owns every bound buffer and outlives the
        // synchronization below.
        if !unsafe { context.enqueue(&stream) } {
            anyhow::bail!("enqueue failed");
        }
        stream.synchronize()?;
        Ok(start.elapsed())
    };

    for _ in 0..warmup {
        launch()?;
    }
    debug!("Warmed up with {} launches", warmup);

    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        samples.push(launch()?);
        pb.inc(1);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let samples = (1..=100).map(Duration::from_micros).collect();
        let stats = Stats::from_samples(samples).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, Duration::from_micros(1));
        assert_eq!(stats.max, Duration::from_micros(100));
        assert_eq!(stats.p50, Duration::from_micros(51));
        assert_eq!(stats.p99, Duration::from_micros(99));
        assert_eq!(stats.mean, Duration::from_nanos(50_500));
    }

    #[test]
    fn test_stats_empty() {
        assert_eq!(Stats::from_samples(Vec::new()), None);
    }
}
