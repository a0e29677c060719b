//! KivIO Cache Node - cache node daemon
//!
//! Joins the cache master, then serves the client-facing API on one
//! listener and the internal cache protocol on another.

use anyhow::Result;
use clap::Parser;
use kivio_cache::CacheNode;
use kivio_common::{Config, HttpTransport, Transport};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kivio-cachenode")]
#[command(about = "KivIO cache node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kivio/kivio.toml")]
    config: String,

    /// HTTP address to serve the client API on
    #[arg(long)]
    http_addr: String,

    /// Address to serve the internal cache protocol on
    #[arg(long)]
    node_addr: String,

    /// Cache master address (overrides config)
    #[arg(long)]
    master_addr: Option<String>,

    /// Cache byte budget (overrides config)
    #[arg(long)]
    cache_bytes: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Config {
    if std::path::Path::new(path).exists() {
        let raw = std::fs::read_to_string(path).unwrap_or_default();
        toml::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config);
    if let Some(master_addr) = &args.master_addr {
        config.cache_master_addr = master_addr.clone();
    }
    if let Some(cache_bytes) = args.cache_bytes {
        config.cache_bytes = cache_bytes;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        http = args.http_addr,
        node = args.node_addr,
        master = config.cache_master_addr,
        budget = config.cache_bytes,
        "Starting KivIO cache node"
    );

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(config.request_timeout())?);

    let node = CacheNode::new(
        &args.http_addr,
        &args.node_addr,
        &config.cache_master_addr,
        transport,
        &config,
    );

    tokio::select! {
        result = node.start() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}
