//! Transfer cache driver
//!
//! Exercises a [`TransferCacheSystem`] built from configuration:
//! - print the effective configuration
//! - run multi-threaded allocation traffic and check capacity accounting
//! - run traffic and export the resulting Prometheus metrics
//!
//! # Examples
//!
//! ```bash
//! # Show the configuration after file and TCACHE_* overrides
//! tcache --config tcache.toml config
//!
//! # Four threads of random traffic for two seconds
//! tcache stress --threads 4 --duration-ms 2000
//!
//! # Same, against the lock-free caches
//! TCACHE_IMPLEMENTATION=lock_free tcache stress
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transfer_cache::error::Error;
use transfer_cache::{metrics, Batch, ManagerStats, TransferCacheConfig, TransferCacheSystem};

/// Transfer cache driver
#[derive(Parser, Debug)]
#[command(name = "tcache")]
#[command(version = transfer_cache::VERSION)]
#[command(about = "Drive and inspect allocator transfer caches", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "TCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "TCACHE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Run random traffic from several threads and verify accounting
    Stress(TrafficArgs),

    /// Run random traffic and print Prometheus metrics
    Metrics(TrafficArgs),
}

/// Traffic generator arguments
#[derive(Args, Debug)]
struct TrafficArgs {
    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Run time in milliseconds
    #[arg(short, long, default_value = "1000")]
    duration_ms: u64,

    /// Seed for reproducible traffic
    #[arg(long)]
    seed: Option<u64>,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = TransferCacheConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Stress(args) => stress_command(&config, &args),
        Commands::Metrics(args) => metrics_command(&config, &args),
    }
}

/// Setup logging with console output and an optional rolling file
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "tcache.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Stress command - random traffic, then accounting checks
fn stress_command(config: &TransferCacheConfig, args: &TrafficArgs) -> anyhow::Result<()> {
    let system = TransferCacheSystem::from_config(config)?;
    let report = run_traffic(&system, args)?;
    let stats = system.stats();

    info!(
        operations = report.operations,
        exhausted = report.exhausted,
        hit_rate = %format!("{:.3}", overall_hit_rate(&stats)),
        "Traffic finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_summary(&stats);
    }

    verify(&stats)?;
    println!("OK: {} operations, capacity accounting consistent", report.operations);
    Ok(())
}

/// Metrics command - random traffic, then a Prometheus export
fn metrics_command(config: &TransferCacheConfig, args: &TrafficArgs) -> anyhow::Result<()> {
    let system = TransferCacheSystem::from_config(config)?;
    run_traffic(&system, args)?;

    metrics::init_metrics()?;
    metrics::record_stats(&system.stats());
    print!("{}", metrics::export_metrics()?);
    Ok(())
}

struct TrafficReport {
    operations: u64,
    exhausted: u64,
}

/// Allocate and free objects from `args.threads` threads until the deadline,
/// then return everything still held
fn run_traffic(system: &TransferCacheSystem, args: &TrafficArgs) -> anyhow::Result<TrafficReport> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }

    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
    let classes = system.num_size_classes();
    if classes == 0 {
        warn!("No size classes configured, nothing to do");
        return Ok(TrafficReport {
            operations: 0,
            exhausted: 0,
        });
    }
    info!(
        threads = args.threads,
        size_classes = classes,
        implementation = ?system.implementation(),
        "Starting traffic"
    );

    let results: Vec<anyhow::Result<TrafficReport>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let mut rng = match args.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker as u64)),
                    None => StdRng::from_entropy(),
                };
                scope.spawn(move || worker_loop(system, classes, deadline, &mut rng))
            })
            .collect();

        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked"))))
            .collect()
    });

    let mut total = TrafficReport {
        operations: 0,
        exhausted: 0,
    };
    for result in results {
        let report = result?;
        total.operations += report.operations;
        total.exhausted += report.exhausted;
    }
    Ok(total)
}

fn worker_loop(
    system: &TransferCacheSystem,
    classes: usize,
    deadline: Instant,
    rng: &mut StdRng,
) -> anyhow::Result<TrafficReport> {
    let mut held: Vec<Vec<Batch>> = vec![Vec::new(); classes];
    let mut report = TrafficReport {
        operations: 0,
        exhausted: 0,
    };

    while Instant::now() < deadline {
        let size_class = rng.gen_range(0..classes);
        let batch_size = system.num_objects_to_move(size_class)?;
        let choice: f64 = rng.gen();

        if choice < 0.45 {
            let n = if rng.gen_bool(0.75) {
                batch_size
            } else {
                rng.gen_range(1..=batch_size)
            };
            match system.remove_range(size_class, n) {
                Ok(batch) => held[size_class].push(batch),
                Err(Error::CentralFreeListExhausted { partial, .. }) => {
                    report.exhausted += 1;
                    if !partial.is_empty() {
                        held[size_class].push(partial);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        } else if choice < 0.9 {
            let len = held[size_class].len();
            if len > 0 {
                let batch = held[size_class].swap_remove(rng.gen_range(0..len));
                system.insert_range(size_class, batch)?;
            }
        } else if choice < 0.95 {
            system.make_space(size_class);
        } else if choice < 0.98 {
            system.release_capacity(size_class);
        } else {
            system.grow_cache(size_class);
        }
        report.operations += 1;
    }

    for (size_class, batches) in held.into_iter().enumerate() {
        for batch in batches {
            system.insert_range(size_class, batch)?;
        }
    }
    Ok(report)
}

fn overall_hit_rate(stats: &ManagerStats) -> f64 {
    let (hits, total) = stats.caches.iter().fold((0u64, 0u64), |(h, t), c| {
        let hits = c.insert_hits + c.remove_hits;
        (h + hits, t + hits + c.insert_misses + c.remove_misses)
    });
    if total > 0 {
        hits as f64 / total as f64
    } else {
        0.0
    }
}

fn print_summary(stats: &ManagerStats) {
    println!(
        "budget={} unassigned={} capacity={} occupied={}",
        stats.budget, stats.unassigned, stats.total_capacity, stats.total_occupied
    );
    println!(
        "{:>5} {:>6} {:>8} {:>8} {:>10} {:>10} {:>8} {:>8}",
        "class", "batch", "capacity", "occupied", "hits", "misses", "spills", "grants"
    );
    for c in &stats.caches {
        println!(
            "{:>5} {:>6} {:>8} {:>8} {:>10} {:>10} {:>8} {:>8}",
            c.size_class,
            c.batch_size,
            c.capacity,
            c.occupied,
            c.insert_hits + c.remove_hits,
            c.insert_misses + c.remove_misses,
            c.spills,
            c.capacity_grants
        );
    }
}

/// Capacity is conserved and no cache holds more than it may
fn verify(stats: &ManagerStats) -> anyhow::Result<()> {
    if stats.total_capacity + stats.unassigned != stats.budget {
        bail!(
            "capacity leak: {} assigned + {} unassigned != budget {}",
            stats.total_capacity,
            stats.unassigned,
            stats.budget
        );
    }
    for c in &stats.caches {
        if c.occupied > c.capacity || c.capacity > c.max_capacity {
            bail!(
                "size class {} out of bounds: occupied {} capacity {} max {}",
                c.size_class,
                c.occupied,
                c.capacity,
                c.max_capacity
            );
        }
    }
    Ok(())
}
