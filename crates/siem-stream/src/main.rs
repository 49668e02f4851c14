//! SIEM live stream consumer - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Headless consumer for the SIEM live event stream
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via SIEM_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any wss:// connection
    siem_ws::init_crypto();

    let args = Args::parse();

    siem_telemetry::init_logging()?;

    info!("Starting siem-stream v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > SIEM_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("SIEM_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let config = siem_stream::AppConfig::from_file(&config_path)?;
    info!(
        ws_url = %config.ws_url,
        max_attempts = config.channel.max_attempts,
        restart = config.restart.enabled,
        "Configuration loaded"
    );

    let summary = siem_stream::Application::new(config)?.run().await?;
    info!(events = summary.events(), "Stopped");

    Ok(())
}
