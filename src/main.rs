//! MQTT Protocol Gateway CLI
//!
//! Runs the embedded broker in front of the loopback backend.

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_protocol_gateway::backend::LoopbackRouter;
use mqtt_protocol_gateway::broker::EmbeddedBroker;
use mqtt_protocol_gateway::{Gateway, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// MQTT Protocol Gateway
#[derive(Parser, Debug)]
#[command(name = "mqtt-protocol-gateway")]
#[command(version)]
#[command(about = "MQTT front end for a request/response backend", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt().with_env_filter(filter).with_target(true).init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MQTT Protocol Gateway"
    );

    // Load configuration
    let mut config: GatewayConfig = if let Some(config_path) = &args.config {
        info!(path = %config_path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&content)?
    } else {
        GatewayConfig::default()
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    let broker = EmbeddedBroker::bind(&config.listen_addr(), &config.general).await?;
    let backend = Arc::new(LoopbackRouter::new());
    let gateway = Arc::new(Gateway::new(&config, backend, Arc::new(broker.clone()))?);

    info!(
        addr = %broker.local_addr(),
        request = %gateway.routing().request_target(),
        response = %gateway.routing().response_base(),
        "Gateway initialized"
    );

    tokio::select! {
        result = broker.serve(gateway) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
