use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bsa_kar::{NoopEhrQuery, ResumeTaskQueue, ResumeWorker};
use bsa_worker::adapters::BundleEhrQuery;
use bsa_worker::cli::{Cli, Commands, RunArgs, ValidateArgs};
use bsa_worker::config::AppConfig;
use bsa_worker::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use bsa_worker::loader::{PatientBundle, load_artifacts};
use bsa_worker::{Runtime, observability};
use clap::Parser;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From BSA_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (bsa.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (BSA_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    observability::init_tracing();

    let cli = Cli::parse();
    let (config_path, source) = resolve_config_path(cli.config.as_deref());

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );
    observability::apply_logging_level(&cfg.logging.level);

    let result = match cli.command {
        Commands::Validate(args) => validate(cfg, args).await,
        Commands::Run(args) => run(cfg, args).await,
        Commands::ShowConfig => show_config(&cfg),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: BSA_CONFIG
/// 3. Default: bsa.toml
fn resolve_config_path(cli_path: Option<&str>) -> (String, ConfigSource) {
    if let Some(path) = cli_path {
        return (path.to_string(), ConfigSource::CliArgument);
    }

    if let Ok(path) = std::env::var("BSA_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
}

async fn validate(cfg: AppConfig, args: ValidateArgs) -> Result<()> {
    let dir = args.artifacts.unwrap_or_else(|| cfg.artifacts.dir.clone());
    let artifacts = load_artifacts(&dir).await?;
    let runtime = Runtime::build(&cfg, Arc::new(NoopEhrQuery));

    for artifact in artifacts {
        let unresolved = artifact.unresolved_edges().len();
        let actions = artifact.actions().count();
        let roots = artifact.roots().count();
        let registered = runtime
            .engine
            .register_artifact(artifact)
            .context("artifact failed registration")?;
        println!(
            "{} {}: {actions} actions, {roots} roots, {unresolved} unresolved related actions",
            registered.id(),
            registered.version().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run(mut cfg: AppConfig, args: RunArgs) -> Result<()> {
    if args.ignore_timers {
        cfg.engine.ignore_timers = true;
    }
    let dir: PathBuf = args
        .artifacts
        .clone()
        .unwrap_or_else(|| cfg.artifacts.dir.clone());
    let artifacts = load_artifacts(&dir).await?;
    let bundle = PatientBundle::load(&args.patient).await?;

    let runtime = Runtime::build(&cfg, Arc::new(BundleEhrQuery::new(bundle.resources.clone())));
    for artifact in artifacts {
        runtime.engine.register_artifact(artifact)?;
    }

    let targets = match &args.artifact {
        Some(id) => vec![id.clone()],
        None => runtime.engine.artifact_ids(),
    };
    if targets.is_empty() {
        anyhow::bail!("No artifacts found in {}", dir.display());
    }

    for artifact_id in targets {
        let mut ctx = runtime
            .engine
            .new_context(&artifact_id)?
            .with_patient(bundle.patient_id.clone());
        ctx.add_input_resources(bundle.resources.iter().cloned());

        let report = runtime
            .engine
            .handle_named_event(&mut ctx, &args.event)
            .await
            .with_context(|| format!("named event {} on artifact {artifact_id}", args.event))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let queue: Arc<dyn ResumeTaskQueue> = runtime.scheduler.clone();
    let worker = ResumeWorker::new(runtime.engine.clone(), queue, cfg.worker.clone());
    let shutdown = worker.start();

    if args.until_idle {
        let mut ticker = tokio::time::interval(cfg.worker.poll_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if runtime.outstanding_tasks() == 0 {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        tracing::info!(
            outstanding = runtime.outstanding_tasks(),
            "Waiting for deferred actions, press Ctrl-C to stop"
        );
        let _ = tokio::signal::ctrl_c().await;
    }

    let _ = shutdown.send(true);
    tracing::info!(
        contexts = runtime.store.len(),
        outstanding = runtime.outstanding_tasks(),
        "Worker stopped"
    );
    Ok(())
}

fn show_config(cfg: &AppConfig) -> Result<()> {
    println!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
