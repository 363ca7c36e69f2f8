//! PC2MQTT - Main Entry Point

use clap::{Parser, Subcommand};
use pc2mqtt::config::BridgeConfig;
use pc2mqtt::handler::builtin::{enabled_names, BUILTIN_HANDLERS};
use pc2mqtt::observability::{init_default_logging, level_for_verbosity};
use pc2mqtt::{Bridge, MqttTransport};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "pc2mqtt.toml";

/// Bridge local host state to an MQTT broker
#[derive(Parser)]
#[command(name = "pc2mqtt")]
#[command(about = "Bridge local host state to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PC2MQTT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run the enabled handlers until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// List the built-in handlers and whether they are enabled
    Handlers,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging(level_for_verbosity(cli.verbose));

    let result = match cli.command {
        Commands::Run => run_bridge(&cli.config).await,
        Commands::Config { show } => handle_config_command(&cli.config, show),
        Commands::Handlers => list_handlers(&cli.config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Load the configuration, or write the default one and return `None`
fn load_or_create(path: &Path) -> Result<Option<BridgeConfig>, Box<dyn std::error::Error>> {
    if path.exists() {
        info!("Loading configuration from: {}", path.display());
        return Ok(Some(BridgeConfig::load_from_file(path)?));
    }

    BridgeConfig::default().save_to_file(path)?;
    warn!(
        "No configuration found; wrote defaults to {}. Edit it and run again.",
        path.display()
    );
    Ok(None)
}

async fn run_bridge(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut config) = load_or_create(path)? else {
        return Ok(());
    };

    if config.handlers.enabled.is_empty() {
        config.handlers.enabled = enabled_names(&config.handlers);
        config.save_to_file(path)?;
        info!(handlers = ?config.handlers.enabled, "Enabled every built-in handler");
    }

    info!(
        "Starting PC2MQTT v{} as device {}",
        env!("CARGO_PKG_VERSION"),
        config.device.id
    );

    let transport = Arc::new(MqttTransport::new(&config.mqtt)?);
    let bridge = Bridge::new(config.clone(), transport)?;
    let report = bridge.start().await?;
    for (handler, e) in &report.failed {
        warn!(handler = %handler, error = %e, "Handler not running");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Running; press q then Enter to quit");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        _ = wait_for_quit() => info!("Quit requested, shutting down..."),
    }

    if let Err(e) = bridge.shutdown().await {
        warn!(error = %e, "Disconnect during shutdown failed");
    }
    config.save_to_file(path)?;
    info!("Application shutdown complete");
    Ok(())
}

/// Resolve once a `q` line is read; never when stdin is closed
async fn wait_for_quit() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().eq_ignore_ascii_case("q") {
            return;
        }
    }
    std::future::pending::<()>().await;
}

fn handle_config_command(path: &Path, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config) = load_or_create(path)? else {
        return Ok(());
    };

    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn list_handlers(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = if path.exists() {
        BridgeConfig::load_from_file(path)?
    } else {
        BridgeConfig::default()
    };
    let enabled = enabled_names(&config.handlers);

    for name in BUILTIN_HANDLERS {
        let marker = if enabled.iter().any(|e| e == name) {
            "enabled"
        } else {
            "disabled"
        };
        println!("{name:<10} {marker}");
    }
    Ok(())
}
