//! docrunner - main entry point

use clap::{Parser, Subcommand};
use docrunner::config::{EngineConfig, SanitizerSection};
use docrunner::context::EngineContext;
use docrunner::control::{ControlChannel, ControlSignal, LogControlChannel, MqttControlChannel};
use docrunner::engine::Engine;
use docrunner::metadata::MetadataResolver;
use docrunner::observability::{init_default_logging, EngineMetrics, HealthServer};
use docrunner::orchestrator::AdapterRegistry;
use docrunner::sanitizer::sanitize_file;
use docrunner::session::ChromiumLauncher;
use docrunner::state::StateStore;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["docrunner.toml", "config/docrunner.toml"];

/// Request lifecycle engine for a document-request board
#[derive(Parser)]
#[command(name = "docrunner")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DOCRUNNER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Strip header watermarks from a PDF in place
    Sanitize {
        pdf: PathBuf,
        /// Rewrite the file even when nothing was removed
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match find_config(&cli.config) {
        Some(path) => match EngineConfig::load_from_file(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                init_default_logging(false);
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                process::exit(1);
            }
        },
        None => None,
    };
    init_default_logging(config.as_ref().is_some_and(|c| c.engine.debug));
    info!(version = env!("CARGO_PKG_VERSION"), "docrunner starting");

    let result = match (cli.command, config) {
        (Commands::Run, Some(config)) => run_engine(config).await,
        (Commands::Config { show }, Some(config)) => handle_config_command(&config, show),
        (Commands::Sanitize { pdf, force }, config) => {
            let mut params = config.map(|c| c.sanitizer).unwrap_or_default();
            params.force_write |= force;
            handle_sanitize_command(&pdf, &params).await
        }
        (_, None) => Err(format!(
            "No configuration file found; pass --config or create one of {}",
            DEFAULT_CONFIG_PATHS.join(", ")
        )
        .into()),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        process::exit(1);
    }
}

fn find_config(explicit: &Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.clone());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

async fn run_engine(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(engine_id = %config.engine.id, dry_run = config.engine.dry_run, "Building engine");

    let metrics = Arc::new(EngineMetrics::new());
    metrics.set_engine_state("initializing");
    let (signal_tx, signal_rx) = mpsc::channel::<ControlSignal>(32);
    let control = build_control(&config, metrics.clone(), signal_tx).await?;

    let state = Arc::new(StateStore::load(&config.engine.state_file));
    let adapters = AdapterRegistry::from_config(&config.sources)?;
    let resolver = MetadataResolver::from_config(&config.metadata)?;
    let launcher = Arc::new(ChromiumLauncher::new(config.session.clone()));
    let health = config.health.clone();
    let control_required = config.control.is_some();

    let ctx = EngineContext::new(config, state.clone(), control, metrics.clone());
    let engine_id = ctx.engine_id().to_string();
    let engine = Engine::new(ctx, launcher, adapters, resolver);

    if let Some(health) = health {
        let port = std::env::var("HEALTH_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(health.port);
        let server = Arc::new(HealthServer::new(
            engine_id,
            port,
            metrics.clone(),
            state,
            control_required,
        ));
        tokio::spawn(server.start());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let runner = tokio::spawn(engine.clone().run(signal_rx));
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    metrics.set_engine_state("stopping");
    engine.shutdown().await;
    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Engine stopped with an error"),
        Err(e) => warn!(error = %e, "Engine task panicked"),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn build_control(
    config: &EngineConfig,
    metrics: Arc<EngineMetrics>,
    signals: mpsc::Sender<ControlSignal>,
) -> Result<Arc<dyn ControlChannel>, Box<dyn std::error::Error>> {
    match &config.control {
        Some(section) => {
            let channel =
                MqttControlChannel::connect(&config.engine.id, section.clone(), metrics, signals)
                    .await?;
            Ok(Arc::new(channel))
        }
        None => {
            info!("No control broker configured; notifications go to the log");
            Ok(Arc::new(LogControlChannel))
        }
    }
}

fn handle_config_command(config: &EngineConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!(engine_id = %config.engine.id, "Configuration valid");
    Ok(())
}

async fn handle_sanitize_command(
    pdf: &PathBuf,
    params: &SanitizerSection,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = pdf.clone();
    let params = params.clone();
    let outcome = tokio::task::spawn_blocking(move || sanitize_file(&path, &params)).await??;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
