//! Fashion-analysis orchestrator - Main Entry Point

use clap::{Parser, Subcommand};
use fashion_eep::api::{self, AppState};
use fashion_eep::client::{HttpServiceClient, ServiceClient};
use fashion_eep::config::OrchestratorConfig;
use fashion_eep::health::HealthCheckManager;
use fashion_eep::observability::{init_default_logging, prometheus};
use fashion_eep::pipeline::PipelineExecutor;
use fashion_eep::stages::{builtin_definitions, ExecutionPlan};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["eep.toml", "config/eep.toml"];

/// Orchestrator for the fashion-analysis inference services
#[derive(Parser)]
#[command(name = "eep")]
#[command(about = "Runs the fashion-analysis pipeline across the inference services")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EEP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print the execution plan layer by layer
    Plan,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        "Starting fashion-analysis orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let plan = match ExecutionPlan::build(builtin_definitions(), &config) {
        Ok(plan) => Arc::new(plan),
        Err(e) => {
            error!("Invalid stage configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve { bind } => run_server(config, plan, bind).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Plan => handle_plan_command(&plan),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(OrchestratorConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(OrchestratorConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using environment only");
    Ok(OrchestratorConfig::from_env()?)
}

async fn run_server(
    config: OrchestratorConfig,
    plan: Arc<ExecutionPlan>,
    bind: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = match bind {
        Some(addr) => addr,
        None => config.bind_addr()?,
    };

    let handle = prometheus::install()?;
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    let client: Arc<dyn ServiceClient> = Arc::new(HttpServiceClient::new());
    let executor = PipelineExecutor::from_config(plan.clone(), client.clone(), &config);
    let health = HealthCheckManager::for_plan(&plan, &config, client);
    let state = Arc::new(
        AppState::new(executor, health, config.limits.clone()).with_prometheus(handle),
    );

    api::serve(state, addr, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            if signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down gracefully...");
            }
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

fn handle_config_command(
    config: &OrchestratorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn handle_plan_command(plan: &ExecutionPlan) -> Result<(), Box<dyn std::error::Error>> {
    for (index, layer) in plan.layers().iter().enumerate() {
        println!("layer {index}:");
        for name in layer {
            if let Some(stage) = plan.stage(*name) {
                println!(
                    "  {:<15} {:<6} {:>6}ms  {}{}",
                    name.as_str(),
                    if stage.required() { "req" } else { "opt" },
                    stage.timeout.as_millis(),
                    stage.endpoint,
                    format_dependencies(stage),
                );
            }
        }
    }
    Ok(())
}

fn format_dependencies(stage: &fashion_eep::stages::PlannedStage) -> String {
    let dependencies: Vec<String> = stage
        .definition
        .dependencies
        .iter()
        .map(|d| format!("{}({:?})", d.stage, d.mode).to_lowercase())
        .collect();
    if dependencies.is_empty() {
        String::new()
    } else {
        format!("  <- {}", dependencies.join(", "))
    }
}
