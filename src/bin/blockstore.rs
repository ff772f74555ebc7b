//! Block store command-line tool
//!
//! Drives the engine outside of an embedding application:
//! - Randomized workloads checked against a shadow copy
//! - A defragmentation demonstration
//! - Prometheus metrics and effective configuration output
//!
//! # Examples
//!
//! ```bash
//! # Run 10k seeded operations on an off-heap store
//! blockstore workload --ops 10000 --seed 7 --kind off_heap
//!
//! # Show what a full defrag does to a fragmented table
//! blockstore --config store.toml defrag-demo
//!
//! # Print the effective configuration
//! blockstore config
//! ```

use anyhow::Context;
use blockstore::storage::{StorageKind, StoredBytes};
use blockstore::{BlockStore, EngineConfig, EngineStats};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// In-process block storage engine tools
#[derive(Parser, Debug)]
#[command(name = "blockstore")]
#[command(version = blockstore::VERSION)]
#[command(about = "In-process block storage engine tools", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "BLOCKSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "BLOCKSTORE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a seeded random workload and verify every read
    Workload(WorkloadArgs),

    /// Fragment a store, defragment it, and print both states
    DefragDemo,

    /// Run a short workload and print Prometheus metrics
    Metrics,

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct WorkloadArgs {
    /// Number of operations
    #[arg(long, default_value = "10000")]
    ops: usize,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Largest payload written by one operation
    #[arg(long, default_value = "4096")]
    max_bytes: usize,

    /// Override the configured storage kind (heap, off_heap, mapped_file)
    #[arg(long)]
    kind: Option<StorageKind>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Workload(args) => workload_command(config, args),
        Commands::DefragDemo => defrag_demo_command(config),
        Commands::Metrics => metrics_command(config),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("blockstore {}", blockstore::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "blockstore.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    // Console logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Outcome counts of a workload run
#[derive(Debug, Default, serde::Serialize)]
struct WorkloadReport {
    allocations: usize,
    writes: usize,
    appends: usize,
    deletions: usize,
    verified_reads: usize,
    live_at_end: usize,
}

fn run_workload(
    store: &BlockStore,
    ops: usize,
    seed: u64,
    max_bytes: usize,
) -> anyhow::Result<(WorkloadReport, EngineStats)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(StoredBytes, Vec<u8>)> = Vec::new();
    let mut report = WorkloadReport::default();

    for step in 0..ops {
        let roll = rng.gen_range(0..100);
        if live.is_empty() || roll < 30 {
            let content = random_payload(&mut rng, max_bytes);
            live.push((store.allocate_with(&content)?, content));
            report.allocations += 1;
        } else if roll < 50 {
            let idx = rng.gen_range(0..live.len());
            let content = random_payload(&mut rng, max_bytes);
            live[idx].0.set_bytes(&content)?;
            live[idx].1 = content;
            report.writes += 1;
        } else if roll < 60 {
            let idx = rng.gen_range(0..live.len());
            let extra = random_payload(&mut rng, max_bytes / 4);
            live[idx].0.append(&extra)?;
            live[idx].1.extend_from_slice(&extra);
            report.appends += 1;
        } else if roll < 80 {
            let idx = rng.gen_range(0..live.len());
            let (item, _) = live.swap_remove(idx);
            item.delete()?;
            report.deletions += 1;
        } else {
            let idx = rng.gen_range(0..live.len());
            let (item, expected) = &live[idx];
            let actual = item.get_bytes()?;
            anyhow::ensure!(
                &actual == expected,
                "step {}: payload {} diverged from its shadow copy",
                step,
                item.id()
            );
            report.verified_reads += 1;
        }
    }

    for (item, expected) in &live {
        anyhow::ensure!(
            &item.get_bytes()? == expected,
            "payload {} diverged from its shadow copy",
            item.id()
        );
        report.verified_reads += 1;
    }
    report.live_at_end = live.len();
    debug!(?report, "Workload finished");

    // Taken while the surviving payloads are still allocated
    let stats = store.stats()?;
    Ok((report, stats))
}

fn random_payload(rng: &mut StdRng, max_bytes: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max_bytes);
    let mut payload = vec![0u8; len];
    rng.fill(&mut payload[..]);
    payload
}

/// Workload command - randomized operations verified against a shadow copy
fn workload_command(mut config: EngineConfig, args: WorkloadArgs) -> anyhow::Result<()> {
    if let Some(kind) = args.kind {
        config = config.with_storage_kind(kind);
    }
    info!(ops = args.ops, seed = args.seed, kind = %config.storage_kind, "Running workload");

    let store = BlockStore::open(config)?;
    let (report, stats) = run_workload(&store, args.ops, args.seed, args.max_bytes)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "workload": report,
            "stats": stats,
        }))?
    );
    store.close()?;
    Ok(())
}

/// Defrag demo command - fragment, compact, verify
fn defrag_demo_command(config: EngineConfig) -> anyhow::Result<()> {
    let block_size = config.block_size;
    let store = BlockStore::open(config)?;

    let items = (0..32usize)
        .map(|i| {
            let content = vec![i as u8; block_size * (1 + i % 4)];
            store.allocate_with(&content).map(|item| (item, content))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut survivors = Vec::new();
    for (i, (item, content)) in items.into_iter().enumerate() {
        if i % 2 == 0 {
            item.delete()?;
        } else {
            survivors.push((item, content));
        }
    }

    let before = store.stats()?;
    let migrations = store.defragment()?;
    let after = store.stats()?;

    for (item, content) in &survivors {
        anyhow::ensure!(
            &item.get_bytes()? == content,
            "payload {} changed during defrag",
            item.id()
        );
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "before": before,
            "migrations": migrations,
            "after": after,
        }))?
    );
    Ok(())
}

/// Metrics command - short workload, then Prometheus exposition
fn metrics_command(config: EngineConfig) -> anyhow::Result<()> {
    let store = BlockStore::open(config)?;
    run_workload(&store, 1000, 1, 1024)?;
    store.defragment()?;
    print!("{}", blockstore::metrics::export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_workload() {
        let cli = Cli::parse_from([
            "blockstore",
            "--no-color",
            "workload",
            "--ops",
            "50",
            "--kind",
            "off_heap",
        ]);
        match cli.command {
            Commands::Workload(args) => {
                assert_eq!(args.ops, 50);
                assert_eq!(args.kind, Some(StorageKind::OffHeap));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.no_color);
    }

    #[test]
    fn test_workload_is_deterministic() -> anyhow::Result<()> {
        let config = EngineConfig::default().with_block_size(64).with_initial_block_count(16);
        let (a, stats_a) = run_workload(&BlockStore::open(config.clone())?, 300, 9, 512)?;
        let (b, stats_b) = run_workload(&BlockStore::open(config)?, 300, 9, 512)?;
        assert_eq!(a.allocations, b.allocations);
        assert_eq!(a.deletions, b.deletions);
        assert!(a.verified_reads > 0);
        assert_eq!(stats_a.live_handles, a.live_at_end);
        assert_eq!(stats_a.used_blocks, stats_b.used_blocks);
        Ok(())
    }
}
