//! nexscan CLI
//!
//! Plans scan files from a JSON configuration and simulates scans into
//! them, in memory or (with the `hdf5` feature) on disk.
#![allow(clippy::uninlined_format_args, clippy::too_many_lines)]

use clap::{Parser, Subcommand};
use log::info;
use nexscan_core::{ScanConfig, ScanShape};
use nexscan_io::{
    dump_layout, format_duration, MemoryTree, NexusTree, ScanFile, ScanOutcome, ScanPlan,
    ScanSummary, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("Scan file error: {0}")]
    NexscanIo(#[from] nexscan_io::Error),

    #[error("Configuration error: {0}")]
    Core(#[from] nexscan_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(not(feature = "hdf5"))]
    #[error("writing {0} needs the `hdf5` feature")]
    Hdf5Disabled(PathBuf),
}

/// Scan metadata and multi-writer synchronisation for NeXus scan files.
#[derive(Parser)]
#[command(name = "nexscan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the planned shape, chunking and writers of a scan
    Plan {
        /// Scan configuration (JSON)
        config: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Simulate a scan, filling every in-process field
    Run {
        /// Scan configuration (JSON)
        config: PathBuf,

        /// Output NeXus file; the scan is kept in memory when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Abort the scan after this many points
        #[arg(long)]
        abort_after: Option<usize>,
    },

    /// Simulate a scan in memory and print the resulting tree
    Layout {
        /// Scan configuration (JSON)
        config: PathBuf,

        /// Abort the scan after this many points
        #[arg(long)]
        abort_after: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if let Err(err) = execute(cli.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Plan { config, json } => {
            let config = ScanConfig::from_file(&config)?;
            let plan = ScanPlan::new(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
            } else {
                print_plan(&plan);
            }
        }
        Commands::Run {
            config,
            output,
            abort_after,
        } => {
            let config = ScanConfig::from_file(&config)?;
            let summary = match output {
                Some(path) => run_to_file(&config, path, abort_after)?,
                None => drive(MemoryTree::new(), "memory", &config, abort_after)?.1,
            };
            print_summary(&summary);
        }
        Commands::Layout {
            config,
            abort_after,
        } => {
            let config = ScanConfig::from_file(&config)?;
            let (tree, _) = drive(MemoryTree::new(), "memory", &config, abort_after)?;
            for line in dump_layout(&tree, "/")? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

#[cfg(feature = "hdf5")]
fn run_to_file(config: &ScanConfig, path: PathBuf, abort_after: Option<usize>) -> Result<ScanSummary> {
    let tree = nexscan_io::Hdf5Tree::create(&path)?;
    let label = path.display().to_string();
    let (_, summary) = drive(tree, label, config, abort_after)?;
    info!("Wrote {}", path.display());
    Ok(summary)
}

#[cfg(not(feature = "hdf5"))]
fn run_to_file(_config: &ScanConfig, path: PathBuf, _abort_after: Option<usize>) -> Result<ScanSummary> {
    Err(CliError::Hdf5Disabled(path))
}

/// Runs every position of the configured path through a new scan file.
/// A per-point failure aborts the scan, which is still finalized.
fn drive<T: NexusTree>(
    tree: T,
    label: impl Into<String>,
    config: &ScanConfig,
    abort_after: Option<usize>,
) -> Result<(T, ScanSummary)> {
    let mut scan = ScanFile::configure(tree, label, config, Arc::new(SystemClock))?;
    let total = scan.shape().point_count();
    let written = match scan.simulate(&config.path, abort_after) {
        Ok(written) => written,
        Err(err) => {
            scan.finish(ScanOutcome::Aborted)?;
            return Err(err.into());
        }
    };
    let outcome = if written < total {
        ScanOutcome::Aborted
    } else {
        ScanOutcome::Completed
    };
    info!("Simulated {written} of {total} points");
    Ok(scan.finish(outcome)?)
}

fn chunk_line(shape: &ScanShape) -> String {
    format!(
        "allocated {:?}, chunk {:?}",
        shape.allocation_shape(),
        shape.chunk_shape()
    )
}

fn print_plan(plan: &ScanPlan) {
    println!("Scan Plan");
    println!("=========");
    println!("Entry:          {}", plan.layout.entry());
    println!("Metadata:       {}", plan.layout.metadata());
    println!("Rank:           {}", plan.shape.outer_rank());
    println!("Shape:          {:?}", plan.shape.scan_sizes());
    println!("Points:         {}", plan.shape.point_count());
    println!("Layout:         {}", chunk_line(&plan.shape));
    println!("Axes:           {:?}", plan.axis_names);
    println!("Key timing:     {:?}", plan.key_timing());
    println!(
        "Global keys:    {}",
        if plan.registry.writes_global_keys() {
            "written"
        } else {
            "suppressed"
        }
    );
    println!("Estimated time: {}", format_duration(plan.estimated_duration_s));
    println!();
    println!("Writers:");
    for writer in plan.registry.writers() {
        println!("  {:<16} {:?}", writer.name, writer.kind());
    }
    for link in plan.registry.key_links() {
        println!("  keys/{} <- {:?}", link.name, link.target);
    }
}

fn plan_json(plan: &ScanPlan) -> serde_json::Value {
    serde_json::json!({
        "entry": plan.layout.entry(),
        "rank": plan.shape.outer_rank(),
        "shape": plan.shape.scan_sizes(),
        "allocation_shape": plan.shape.allocation_shape(),
        "chunk_shape": plan.shape.chunk_shape(),
        "points": plan.shape.point_count(),
        "axes": plan.axis_names,
        "global_keys": plan.registry.writes_global_keys(),
        "key_links": plan
            .registry
            .key_links()
            .iter()
            .map(|link| link.name.clone())
            .collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &ScanSummary) {
    println!("Scan Summary");
    println!("============");
    println!("File:      {}", summary.label);
    println!("Outcome:   {:?}", summary.outcome);
    println!("Shape:     {:?}", summary.shape);
    println!("Estimated: {}", format_duration(summary.estimated_s));
    println!("Actual:    {}", format_duration(summary.actual_s));
    println!(
        "Dead time: {} ({:.1}%)",
        format_duration(summary.dead_time_s),
        summary.dead_time_percent
    );
}
