//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the GridLink daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use gridlink_adapter::AdapterManager;
use gridlink_bus::{BrokerTransport, BusClient, BusMetricsExporter, MockBroker, MqttTransport};
use gridlink_common::config::{AppConfig, BrokerKind, Mode};
use gridlink_common::logging::init_tracing;
use prometheus::Registry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "GridLink telemetry daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Development,
    Simulation,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Development => Mode::Development,
            CliMode::Simulation => Mode::Simulation,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the daemon")]
    Run,
    #[command(about = "Parse and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/gridlink.yaml"));
    candidates.push(PathBuf::from("configs/gridlink.dev.yaml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, loaded.source).await,
        Commands::CheckConfig => {
            println!(
                "{} ok: mode={:?} devices={}",
                loaded.source.display(),
                config.mode,
                config.devices.len()
            );
            Ok(())
        }
    }
}

async fn run_daemon(config: AppConfig, config_path: PathBuf) -> Result<()> {
    init_tracing("gridlinkd", &config.logging)?;
    info!(
        config = %config_path.display(),
        mode = ?config.mode,
        devices = config.devices.len(),
        "configuration loaded"
    );

    let transport: Arc<dyn BrokerTransport> = match config.bus.broker {
        BrokerKind::Mock => {
            if matches!(config.mode, Mode::Production) {
                warn!("production mode with the in-memory broker; telemetry stays in-process");
            }
            // the broker lives inside this transport's shared state; every
            // component in the process talks through the same BusClient
            Arc::new(MockBroker::new().attach())
        }
        BrokerKind::Mqtt => Arc::new(MqttTransport::new(
            &config.bus.client_id,
            &config.bus.host,
            config.bus.port,
            Duration::from_secs(config.bus.keep_alive_secs),
        )),
    };

    let registry = Registry::new();
    let metrics = Arc::new(BusMetricsExporter::register(&registry)?);
    let bus = Arc::new(BusClient::with_metrics(
        transport,
        config.bus.reconnect.clone(),
        metrics,
    ));
    bus.initialize().await?;
    info!(broker = ?config.bus.broker, "message bus connected");

    let manager = AdapterManager::new(config.mode, Arc::clone(&bus));
    for device in &config.devices {
        if let Err(err) = manager.add_device(device.clone()).await {
            warn!(device_id = device.id, error = %err, "device registration failed");
        }
    }
    info!(devices = manager.device_count(), "adapter fleet registered");

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    manager.shutdown().await;
    bus.shutdown().await?;
    Ok(())
}
