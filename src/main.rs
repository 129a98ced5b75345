//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::catalog::{roles, standard_registry};
use converge::cli::{Cli, Commands, OutputFormatter, StateCommands};
use converge::config::{find_config_file, ConfigParser, ConfigValidator, EngineConfig, ValidationResult};
use converge::encoding::Marshalers;
use converge::engine::{open_store, Engine};
use converge::error::{DecodeFailures, Result};
use converge::graph::ResourceGraph;
use converge::manifest::{ManifestEvaluator, ProgramEvaluator};
use converge::resource::{Decoder, SchemaRegistry};
use converge::state::SnapshotStore;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Validate { manifest, warnings } => {
            cmd_validate(cli.config.as_ref(), manifest.as_deref(), warnings, &formatter)
        }
        Commands::Plan {
            manifest,
            show_replace_steps,
            detailed,
        } => cmd_plan(cli.config.as_ref(), &manifest, show_replace_steps, detailed, &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Validate configuration and, optionally, a manifest.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    manifest_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, registry, result) = load_config(config_path)?;

    let manifest_resources = match manifest_path {
        Some(path) => Some(check_manifest(&config, &registry, path)?),
        None => None,
    };

    println!(
        "{}",
        formatter.format_validation(&config, &result, manifest_resources, show_warnings)
    );
    Ok(())
}

/// Decodes every resource in a manifest, reporting all failures together.
fn check_manifest(config: &EngineConfig, registry: &SchemaRegistry, path: &Path) -> Result<usize> {
    let evaluator = ManifestEvaluator::load(path, &Marshalers::standard())?;
    let stack = &config.project.stack;
    let graph = ResourceGraph::from_registrations(stack, evaluator.registrations(stack)?)?;

    let errors = Decoder::new(registry).check_all(graph.iter());
    if !errors.is_empty() {
        return Err(DecodeFailures { errors }.into());
    }
    for (urn, role) in roles(graph.iter()) {
        debug!(
            "Role {}: path {}, {} inline and {} managed polic(ies)",
            urn.name(),
            role.path.as_deref().unwrap_or("/"),
            role.policies.len(),
            role.managed_policy_arns.len()
        );
    }
    info!("Decoded {} resource(s) from {}", graph.len(), path.display());
    Ok(graph.len())
}

/// Show the plan for a manifest.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    manifest_path: &Path,
    show_replace_steps: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, registry, _) = load_config(config_path)?;
    let marshalers = Marshalers::standard();
    let store = open_store(&config, &marshalers).await?;
    let evaluator = ManifestEvaluator::load(manifest_path, &marshalers)?;

    let engine = Engine::new(&config, &registry, store.as_ref());
    let outcome = engine.plan(&evaluator).await?;

    println!("{}", formatter.format_plan(&outcome, show_replace_steps, detailed));
    Ok(())
}

/// Snapshot management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, _, _) = load_config(config_path)?;
    let store = open_store(&config, &Marshalers::standard()).await?;

    match command {
        StateCommands::Show => {
            if let Some(snapshot) = store.load().await? {
                println!("{}", formatter.format_snapshot(&snapshot));
            } else {
                eprintln!("No snapshot found for stack {}.", config.project.stack);
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or(""), "manual").await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            unlock(store.as_ref(), lock_id.as_deref(), force).await?;
        }
    }

    Ok(())
}

async fn unlock(store: &dyn SnapshotStore, lock_id: Option<&str>, force: bool) -> Result<()> {
    if force {
        match store.lock_info().await? {
            Some(lock) => {
                store.force_unlock().await?;
                eprintln!("Snapshot forcefully unlocked (was held by {}).", lock.holder);
            }
            None => eprintln!("Snapshot is not locked."),
        }
    } else if let Some(id) = lock_id {
        store.release_lock(id).await?;
        eprintln!("Snapshot unlocked.");
    } else {
        eprintln!("Please provide --lock-id or use --force");
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads and validates the configuration and builds the schema registry.
fn load_config(config_path: Option<&PathBuf>) -> Result<(EngineConfig, SchemaRegistry, ValidationResult)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;

    let mut registry = standard_registry();
    let result = ConfigValidator::new(&registry).validate(&config)?;
    config.apply_capabilities(&mut registry);

    Ok((config, registry, result))
}
