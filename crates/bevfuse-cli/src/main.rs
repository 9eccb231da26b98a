//! `bevfuse` – pipeline inspection CLI.
//!
//! Validates a pipeline file and previews the precomputed geometry before a
//! detector is deployed against a real engine.
//!
//! ```text
//! bevfuse check  [PATH]          validate config and calibration
//! bevfuse tables [PATH] [--json] build view-transform tables, print stats
//! ```
//!
//! `PATH` defaults to `~/.bevfuse/pipeline.toml`.  `BEVFUSE_*` environment
//! overrides are applied after loading.

mod config;
mod report;

use bevfuse_perception::view_transform::{CameraGeometry, ViewTransformIndexer};
use bevfuse_types::BevError;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};

use config::PipelineFile;
use report::{PipelineSummary, TableStats};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Check { path: Option<PathBuf> },
    Tables { path: Option<PathBuf>, json: bool },
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self, String> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Self::Help);
        };
        let json = rest.iter().any(|a| a == "--json");
        let mut positional = rest.iter().filter(|a| !a.starts_with("--"));
        let path = positional.next().map(PathBuf::from);
        if let Some(extra) = positional.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        if let Some(flag) = rest.iter().find(|a| a.starts_with("--") && *a != "--json") {
            return Err(format!("unknown flag '{flag}'"));
        }

        match name.as_str() {
            "check" if !json => Ok(Self::Check { path }),
            "check" => Err("'check' does not take --json".to_string()),
            "tables" => Ok(Self::Tables { path, json }),
            "help" | "--help" | "-h" => Ok(Self::Help),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

fn main() -> ExitCode {
    let _guard = bevfuse_runtime::init_tracing("bevfuse");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    debug!(?command, "parsed command line");

    let outcome = match command {
        Command::Help => {
            print_banner();
            print_usage();
            Ok(())
        }
        Command::Check { path } => run_check(path.as_deref()),
        Command::Tables { path, json } => run_tables(path.as_deref(), json),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn run_check(path: Option<&Path>) -> Result<(), String> {
    let file = config::load(path)?;
    let geometries = validate(&file).map_err(|e| e.to_string())?;
    let summary = PipelineSummary::new(&file.detector, camera_names(&file))
        .map_err(|e| e.to_string())?;

    print_banner();
    println!("  {} pipeline is valid", "✓".green().bold());
    println!();
    println!("  Cameras      : {}", summary.cameras.join(", ").bold());
    println!(
        "  Grid         : {} x {} x {} voxels, {} depth bins",
        summary.grid[0], summary.grid[1], summary.grid[2], summary.depth_bins
    );
    println!(
        "  Feature map  : {} x {}   Head: {} x {}",
        summary.feature_map[0], summary.feature_map[1], summary.head[0], summary.head[1]
    );
    println!("  Task heads   : {} ({} classes)", summary.tasks, summary.classes);
    if summary.history_frames == 0 {
        println!("  History      : {}", "disabled".dimmed());
    } else {
        println!(
            "  History      : {} frames, {} KiB",
            summary.history_frames,
            summary.history_bytes / 1024
        );
    }
    debug!(cameras = geometries.len(), "calibration validated");
    Ok(())
}

fn run_tables(path: Option<&Path>, json: bool) -> Result<(), String> {
    let file = config::load(path)?;
    let geometries = validate(&file).map_err(|e| e.to_string())?;
    let params = file
        .detector
        .view_transform_params()
        .map_err(|e| e.to_string())?;
    let tables = ViewTransformIndexer::new(params, file.detector.n_img)
        .build(&geometries)
        .map_err(|e| e.to_string())?;
    let stats = TableStats::from_tables(&tables);

    if stats.valid_samples == 0 {
        warn!("no sample lands inside the BEV grid; check extrinsics and grid bounds");
    }

    if json {
        let out = serde_json::to_string_pretty(&stats)
            .map_err(|e| format!("Failed to serialize stats: {}", e))?;
        println!("{out}");
        return Ok(());
    }

    print_banner();
    println!("  View-transform tables");
    println!();
    println!(
        "  Samples      : {} valid / {} total ({} dropped)",
        stats.valid_samples.to_string().bold(),
        stats.total_samples,
        stats.dropped_samples
    );
    println!(
        "  Cells        : {} of {} occupied ({:.1}%)",
        stats.occupied_cells.to_string().bold(),
        stats.bev_cells,
        stats.occupancy * 100.0
    );
    println!(
        "  Runs         : longest {}, mean {:.2}",
        stats.longest_run, stats.mean_run
    );
    Ok(())
}

/// Validate the detector config and every calibration entry.
fn validate(file: &PipelineFile) -> Result<Vec<CameraGeometry>, BevError> {
    file.detector.validate()?;
    if file.cameras.len() != file.detector.n_img {
        return Err(BevError::CameraCountMismatch {
            expected: file.detector.n_img,
            actual: file.cameras.len(),
        });
    }
    file.cameras
        .iter()
        .map(CameraGeometry::from_calibration)
        .collect()
}

fn camera_names(file: &PipelineFile) -> Vec<String> {
    file.cameras.iter().map(|c| c.name.clone()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __                 ____              "#.bold().cyan());
    println!("{}", r#"  / /_  ___ _   __  / __/_  __________  "#.bold().cyan());
    println!("{}", r#" / __ \/ _ \ | / / / /_/ / / / ___/ _ \ "#.bold().cyan());
    println!("{}", r#"/_.___/\___/___/  /_/  \__,_/____/\___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "bevfuse".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Temporal BEV 3-D detection");
    println!();
}

fn print_usage() {
    println!("  Usage:");
    println!("    {} [PATH]           validate a pipeline file", "bevfuse check".bold());
    println!("    {} [PATH] [--json] view-transform table statistics", "bevfuse tables".bold());
    println!();
    println!("  PATH defaults to {}", config::default_path().display().to_string().dimmed());
}
