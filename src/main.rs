// src/main.rs

use re_bolfi::config::SearchConfig;
use re_bolfi::data::load_observed;
use re_bolfi::inference::Bolfi;
use re_bolfi::models::simulator::{ExternalProcess, SimulatorAdapter};
use re_bolfi::models::summary::TimeBase;
use re_bolfi::models::{build_model, log_discrepancy, DISCREPANCY_NODE, LOG_DISCREPANCY_NODE};
use re_bolfi::search::SearchController;
use re_bolfi::snapshot::Snapshot;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// BOLFI search over the 7-D runaway-electron current-quench parameter space.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file overriding the default search configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Snapshot whose evidence seeds the search.
    #[arg(short, long)]
    resume: Option<PathBuf>,
    /// Directory for snapshots and evidence exports.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Observed current trace (`.npz` with `IP_data`, or CSV).
    #[arg(long)]
    observed: Option<PathBuf>,
    /// Simulation program run once per evidence point.
    #[arg(long)]
    simulator: Option<PathBuf>,
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn enable_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    enable_tracing(&args.log_level);

    let mut config = match &args.config {
        Some(path) => SearchConfig::from_json_file(path)?,
        None => SearchConfig::default(),
    };
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(path) = args.observed {
        config.observed_path = path;
    }
    if let Some(program) = args.simulator {
        config.simulator_program = program;
    }
    config.validate()?;

    let observed = load_observed(&config.observed_path)?;
    tracing::info!(path = %config.observed_path.display(), n_points = observed.ncols(), "observed trace loaded");

    let backend = Arc::new(ExternalProcess::new(&config.simulator_program));
    let adapter = SimulatorAdapter::new(backend, config.simulator.clone());
    std::fs::create_dir_all(&config.simulator.scratch_dir)
        .with_context(|| format!("creating scratch directory {}", config.simulator.scratch_dir.display()))?;

    let mut model = build_model(adapter, &observed, TimeBase::window_25ms(observed.ncols()), config.priors);
    model.add_operation(LOG_DISCREPANCY_NODE, DISCREPANCY_NODE, log_discrepancy)?;

    let mut bolfi = Bolfi::new(model, LOG_DISCREPANCY_NODE, &config)?;
    if let Some(path) = &args.resume {
        let snapshot = Snapshot::load(path)?;
        bolfi = bolfi.with_initial_evidence(&snapshot)?;
    }

    let start = Instant::now();
    let mut controller = SearchController::new(bolfi, config);
    let summary = controller.run()?;

    tracing::info!(
        state = %controller.state(),
        n_evidence = summary.n_evidence,
        snapshots = summary.snapshots.len(),
        elapsed = ?start.elapsed(),
        "search complete"
    );
    let bolfi = controller.into_routine();
    tracing::info!(
        nll = ?bolfi.surrogate().neg_log_likelihood(),
        pending = bolfi.pending(),
        "final surrogate"
    );
    if let Some(best) = summary.optimum_parameters() {
        println!("{}", serde_json::to_string_pretty(&best)?);
    }
    Ok(())
}
