//! Mesh Tunnel Node
//!
//! Runs one tunnel over TCP:
//! - Listens for links from peer nodes
//! - Keeps links to the configured nodes alive
//! - Optionally echoes every message received on a channel

use anyhow::{Context, Result};
use clap::Parser;
use mesh_tunnel::{
    config::{generate_example_config, Config, LoggingConfig},
    transport::TcpTransport,
    tunnel::{ListenOptions, Session, TunnelError},
    Tunnel,
};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh Tunnel Node - encrypted sessions over a mesh of links
#[derive(Parser, Debug)]
#[command(name = "mesh-tunnel-node")]
#[command(about = "Mesh Tunnel Node - encrypted sessions over a mesh of links")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tunnel.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    address: Option<String>,

    /// Peer nodes, comma separated (overrides config)
    #[arg(short, long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Shared token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    /// Listen on this channel and echo every message back
    #[arg(short, long)]
    echo: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(address) = args.address {
        config.tunnel.address = address;
    }
    if !args.nodes.is_empty() {
        config.tunnel.nodes = args.nodes;
    }
    if let Some(token) = args.token {
        config.tunnel.token = token;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;

    let tunnel = Tunnel::new(&config, Arc::new(TcpTransport::default()));
    tunnel.connect().await.context("Failed to connect tunnel")?;

    info!("Mesh Tunnel Node v{}", mesh_tunnel::VERSION);
    info!("Tunnel {} on {}", tunnel.id(), tunnel.address().await);
    for node in &config.tunnel.nodes {
        info!("Peer node: {}", node);
    }

    if let Some(channel) = args.echo {
        let listener = tunnel
            .listen(&channel, ListenOptions::default())
            .await
            .with_context(|| format!("Failed to listen on {}", channel))?;
        info!("Echoing on channel {}", channel);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(session) => {
                        tokio::spawn(echo(session));
                    }
                    Err(e) => {
                        debug!("Echo listener stopped: {}", e);
                        return;
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;

    info!("Shutting down");
    tunnel.close().await.context("Failed to close tunnel")?;

    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none());
    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => registry.with(layer.json()).init(),
        "compact" => registry.with(layer.compact()).init(),
        _ => registry.with(layer.pretty()).init(),
    }

    Ok(())
}

async fn echo(session: Session) {
    debug!("Echo session {} from {}", session.id(), session.remote());

    loop {
        let msg = match session.recv().await {
            Ok(msg) => msg,
            Err(TunnelError::Closed) => break,
            Err(e) => {
                warn!("Echo session {} receive failed: {}", session.id(), e);
                break;
            }
        };

        if let Err(e) = session.send(msg).await {
            warn!("Echo session {} send failed: {}", session.id(), e);
            break;
        }
    }

    session.close().await;
}
