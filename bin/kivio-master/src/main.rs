//! KivIO Master - coordination masters daemon
//!
//! Runs the database master's heartbeat loop and serves the cache master's
//! join endpoint. Everything is wired in dependency order: metadata store
//! first, then the masters, then the server.

use anyhow::Result;
use clap::Parser;
use kivio_cache::CacheMaster;
use kivio_common::{Cluster, Config, HttpTransport, Transport};
use kivio_db::DbMaster;
use kivio_meta::{EtcdStore, MemStore, MetaStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kivio-master")]
#[command(about = "KivIO coordination masters")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kivio/kivio.toml")]
    config: String,

    /// Listen address for the cache master (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Metadata store endpoints (overrides config)
    #[arg(long)]
    meta_endpoints: Vec<String>,

    /// Use an in-process metadata store instead of etcd (local development)
    #[arg(long)]
    mem_meta: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Turn a `:port` shorthand into a bindable socket address.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
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
    if let Some(listen) = &args.listen {
        config.cache_master_addr = listen.clone();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting KivIO masters");

    let meta: Arc<dyn MetaStore> = if args.mem_meta {
        info!("Using in-process metadata store");
        Arc::new(MemStore::new())
    } else {
        info!(endpoints = ?config.meta_endpoints, "Connecting to etcd");
        Arc::new(EtcdStore::connect(&config.meta_endpoints).await?)
    };

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(config.request_timeout())?);

    let db_master = Arc::new(DbMaster::new(
        Arc::clone(&meta),
        Arc::clone(&transport),
        &config,
    ));
    let db_heartbeat = db_master.start();
    info!("DB master heartbeat started");

    let cache_master = CacheMaster::new(
        meta,
        transport,
        Arc::clone(&db_master) as Arc<dyn Cluster>,
        &config,
    )
    .await?;
    let cache_heartbeat = cache_master.spawn_heartbeat();
    let cache_watch = cache_master.spawn_watch();

    let addr = bind_addr(&config.cache_master_addr);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Cache master serving");

    axum::serve(listener, cache_master.router())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    db_heartbeat.abort();
    cache_heartbeat.abort();
    cache_watch.abort();

    info!("Masters shut down gracefully");
    Ok(())
}
