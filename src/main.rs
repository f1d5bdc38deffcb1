// src/main.rs
//
// =============================================================================
// PULSELAB: COMMANDER & ENTRY POINT (v 0.3 )
// =============================================================================
//
// The wiring center.
//
// Modes:
// 1. START: Boots the LabGuardian and serves the inbox until Ctrl-C.
// 2. RUN:   Executes one descriptor directly, bypassing the inbox.
// 3. CHECK: Parses and plans a descriptor without touching hardware.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal;

use pulselab::{
    CancelToken, DriverRegistry, JobDescriptor, LabConfig, LabGuardian, ResultStore, Runner,
    RunnerSettings,
};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "pulselab",
    version,
    about = "Directory-driven measurement orchestrator"
)]
struct Cli {
    /// Debug-level logging (RUST_LOG still wins when set).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the inbox and run jobs until interrupted.
    Start {
        /// Lab root (inbox/, results/, sequences/, ...).
        #[arg(long)]
        root: Option<PathBuf>,

        /// YAML file with LabConfig overrides.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a single descriptor now and persist its result.
    Run {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a descriptor and print the device plan.
    Check {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        root: Option<PathBuf>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Start { root, config } => run_lab(load_config(config, root)?).await,
        Commands::Run { file, root, config } => run_single(load_config(config, root)?, file).await,
        Commands::Check { file, root } => run_check(load_config(None, root)?, file).await,
    }
}

fn load_config(file: Option<PathBuf>, root: Option<PathBuf>) -> Result<LabConfig> {
    let mut cfg = match file {
        Some(path) => LabConfig::from_yaml_file(&path)?,
        None => LabConfig::default(),
    };
    if let Some(root) = root {
        cfg.root = root;
    }
    Ok(cfg)
}

// ============================================================================
// 3. RUNTIME: THE LAB
// ============================================================================

async fn run_lab(cfg: LabConfig) -> Result<()> {
    let shutdown_signal = Arc::new(AtomicBool::new(false));

    let sig_term = shutdown_signal.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("🛑 Interrupt received. Stopping...");
        sig_term.store(true, Ordering::SeqCst);
    });

    log::info!("🚀 Booting lab at {:?}", cfg.root);
    let guardian = LabGuardian::boot(cfg, DriverRegistry::with_defaults())?;
    guardian.run(shutdown_signal).await
}

// ============================================================================
// 4. ONE-SHOT MODES
// ============================================================================

async fn run_single(cfg: LabConfig, file: PathBuf) -> Result<()> {
    let job = JobDescriptor::from_file(&file)?;
    cfg.ensure_dirs()?;

    let store = ResultStore::new(cfg.results_dir()).context("Result store")?;
    // A fresh flag per run: nothing raised before this point can leak in.
    let cancel = CancelToken::new();
    let mut runner = Runner::new(
        DriverRegistry::with_defaults(),
        store,
        RunnerSettings::from(&cfg),
    )
    .with_cancel(cancel.clone());

    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("🛑 Interrupt received. Cancelling at the next safe point...");
        cancel.cancel();
    });

    match runner.execute(&job).await {
        Ok(outcome) => {
            println!("{}", outcome.committed.data_path.display());
            for w in &outcome.dataset.warnings {
                println!("warning: {}", w);
            }
            Ok(())
        }
        Err(failure) => Err(anyhow!(failure)),
    }
}

async fn run_check(cfg: LabConfig, file: PathBuf) -> Result<()> {
    let job = JobDescriptor::from_file(&file)?;
    let store = ResultStore::new(std::env::temp_dir()).context("Scratch store")?;
    let runner = Runner::new(
        DriverRegistry::with_defaults(),
        store,
        RunnerSettings::from(&cfg),
    );
    let plan = runner.plan(&job).await?;

    println!(
        "{} | {} steps x {} averages | {:?}{}",
        job.experiment_type,
        job.dynamic_steps(),
        job.averages,
        job.data.averaging_mode,
        if job.data.compress { " | compressed" } else { "" }
    );
    for dev in plan.snapshots(&job) {
        println!("  [{}] {} ({})", dev.role, dev.name, dev.device_type);
        for s in dev.settings {
            println!("      {}", s);
        }
    }
    match &plan.sequence {
        Some(seq) => println!("  sequence {:?} sha256 {}", seq.path, seq.digest),
        None => println!("  no sequence program"),
    }
    Ok(())
}
