//! drubatch - command-line entry point
//!
//! `run` submits a batch and keeps spawning `process` invocations of this
//! same binary until the batch reports completion. Logs go to stderr; the
//! only thing `process` writes to stdout is its JSON report.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use drubatch::batch::BatchDefinition;
use drubatch::batch::progress::percentage;
use drubatch::cli::{Cli, Commands};
use drubatch::config::EngineConfig;
use drubatch::driver::{SpawnContext, backend_batch_process};
use drubatch::error::BatchError;
use drubatch::invocation::process_batch;
use drubatch::memory::ProcessMemoryProbe;
use drubatch::operations::OperationRegistry;
use drubatch::process_guard::{self, ProcessGuard};
use drubatch::queue::{FileQueueProvider, QueueProvider};
use drubatch::runtime::BatchRuntime;
use drubatch::spawner::{InProcessSpawner, SubprocessSpawner};
use drubatch::store::{BatchStore, FileBatchStore};

/// Initialize tracing on stderr, `info` unless `RUST_LOG` says otherwise
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    let actor = match &cli.command {
        Commands::Run { actor, .. } => actor.clone(),
        _ => None,
    };
    config.apply_overrides(cli.state_dir.clone(), cli.memory_limit.clone(), actor);
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Run {
            definition,
            in_process,
            ..
        } => run_command(&config, &definition, in_process),
        Commands::Process { id } => process_command(&config, id),
        Commands::Status { id } => status_command(&config, id),
        Commands::Validate { definition } => validate_command(&definition),
    }
}

/// Stores rooted at the configured state directory
fn open_stores(config: &EngineConfig) -> Result<(FileBatchStore, FileQueueProvider)> {
    let store = FileBatchStore::open(&config.state_dir)
        .with_context(|| format!("Failed to open batch store in {:?}", config.state_dir))?;
    let queues = FileQueueProvider::open(&config.state_dir)
        .with_context(|| format!("Failed to open queues in {:?}", config.state_dir))?;
    Ok((store, queues))
}

fn run_command(config: &EngineConfig, path: &Path, in_process: bool) -> Result<()> {
    info!("Loading batch definition: {:?}", path);
    let definition = BatchDefinition::load_from_file(path)?;

    let (store, queues) = open_stores(config)?;
    let registry = OperationRegistry::with_builtins();
    let memory = ProcessMemoryProbe::new(config.memory_limit_bytes()?);
    let rt = BatchRuntime::new(&store, &queues, &registry, &memory);
    let context = SpawnContext {
        actor: config.actor.clone(),
    };

    let summary = if in_process {
        let flag = process_guard::register_interrupt_flag()
            .context("Failed to install signal handlers")?;
        let rt = rt.with_interrupt(&flag);
        backend_batch_process(definition, &rt, &InProcessSpawner::new(rt), &context)
    } else {
        // Spawned workers are stopped if we receive SIGINT/SIGTERM/SIGHUP
        if let Err(e) = process_guard::init_signal_handlers() {
            warn!("Failed to initialize signal handlers: {}", e);
        }
        let _guard = ProcessGuard::new();
        let spawner =
            SubprocessSpawner::new(config).context("Cannot locate the current executable")?;
        backend_batch_process(definition, &rt, &spawner, &context)
    }
    .context("Batch did not complete")?;

    info!(
        "Batch {} finished after {} worker invocation(s)",
        summary.id, summary.invocations
    );
    println!("{}", serde_json::to_string_pretty(&summary.result)?);
    Ok(())
}

fn process_command(config: &EngineConfig, id: u64) -> Result<()> {
    let flag =
        process_guard::register_interrupt_flag().context("Failed to install signal handlers")?;

    let (store, queues) = open_stores(config)?;
    let registry = OperationRegistry::with_builtins();
    let memory = ProcessMemoryProbe::new(config.memory_limit_bytes()?);
    let rt = BatchRuntime::new(&store, &queues, &registry, &memory).with_interrupt(&flag);

    let report = process_batch(id, &rt)
        .with_context(|| format!("Worker invocation for batch {} failed", id))?;

    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn status_command(config: &EngineConfig, id: u64) -> Result<()> {
    let (store, queues) = open_stores(config)?;
    let state = store.load(id)?.ok_or(BatchError::NotFound(id))?;

    println!(
        "Batch {}: {} set(s), current set {}, {} item(s) remaining{}",
        state.id,
        state.sets.len(),
        state.current_set,
        state.remaining(),
        if state.running { ", running" } else { "" }
    );

    for (index, set) in state.sets.iter().enumerate() {
        let pending = queues.queue_for(set)?.list_all()?.len();
        let title = if set.title.is_empty() {
            "(untitled)"
        } else {
            set.title.as_str()
        };
        println!(
            "  [{}] {}: {}/{} done, {} queued, {}%{}",
            index,
            title,
            set.processed(),
            set.total,
            pending,
            percentage(set.total, set.processed() as f64),
            if set.success { " ✓" } else { "" }
        );
    }
    Ok(())
}

fn validate_command(path: &Path) -> Result<()> {
    info!("Validating batch definition: {:?}", path);
    let registry = OperationRegistry::with_builtins();

    match BatchDefinition::load_from_file(path) {
        Ok(definition) => match definition.validate(&registry) {
            Ok(()) => {
                println!(
                    "✓ Batch definition is valid: {} set(s), {} item(s)",
                    definition.sets.len(),
                    definition.item_count()
                );
                Ok(())
            }
            Err(e) => {
                error!("Batch definition validation failed: {}", e);
                eprintln!("✗ Batch definition validation failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Failed to load batch definition: {:#}", e);
            eprintln!("✗ Failed to load batch definition: {:#}", e);
            std::process::exit(1);
        }
    }
}
