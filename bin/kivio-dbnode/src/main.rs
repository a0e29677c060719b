//! KivIO DB Node - database node daemon
//!
//! Registers itself with the database master, bootstraps a new cluster or
//! joins the existing one, and serves the key/value API.

use anyhow::Result;
use clap::Parser;
use kivio_common::{Config, HttpTransport, Transport};
use kivio_db::{DbMaster, DbService, LocalStore};
use kivio_meta::EtcdStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kivio-dbnode")]
#[command(about = "KivIO database node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kivio/kivio.toml")]
    config: String,

    /// HTTP address to serve the key/value API on
    #[arg(long)]
    http_addr: String,

    /// Raft address of this node
    #[arg(long)]
    raft_addr: String,

    /// Data directory for the local store
    #[arg(long, default_value = "./dbnode-data")]
    data_dir: String,

    /// Metadata store endpoints (overrides config)
    #[arg(long)]
    meta_endpoints: Vec<String>,

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
    if !args.meta_endpoints.is_empty() {
        config.meta_endpoints = args.meta_endpoints.clone();
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
        raft = args.raft_addr,
        "Starting KivIO DB node"
    );

    let meta = Arc::new(EtcdStore::connect(&config.meta_endpoints).await?);
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(config.request_timeout())?);

    let master = Arc::new(DbMaster::new(meta, Arc::clone(&transport), &config));
    let store = Arc::new(LocalStore::new(&args.raft_addr, &args.data_dir));
    let service = DbService::new(
        &args.http_addr,
        &args.raft_addr,
        store,
        master,
        transport,
    );

    tokio::select! {
        result = service.start() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}
