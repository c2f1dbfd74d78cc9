use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use taohash_proxy::{
    config::{DEFAULT_DASHBOARD_PORT, DEFAULT_PROXY_PORT, DEFAULT_PROXY_PORT_HIGH},
    dashboard_app, reload_app, ListenPorts, ProxyConfig, ProxyServer, ShareLog,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taohash-proxy", version, about = "TaoHash Stratum V1 mining proxy")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Listener port for the normal pool
    #[arg(long, env = "PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Listener port for the high-difficulty pool
    #[arg(long, env = "PROXY_PORT_HIGH", default_value_t = DEFAULT_PROXY_PORT_HIGH)]
    high_diff_port: u16,

    /// Dashboard listen port
    #[arg(long, default_value_t = DEFAULT_DASHBOARD_PORT)]
    dashboard_port: u16,

    /// Internal reload API address
    #[arg(long, default_value = taohash_proxy::config::DEFAULT_RELOAD_ADDR)]
    reload_addr: SocketAddr,

    /// Share log SQLite file
    #[arg(long, default_value = "data/shares.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match ProxyConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let ports = ListenPorts {
        normal: args.port,
        high_diff: args.high_diff_port,
    };

    info!("Starting with configuration:");
    for (label, pool) in &config.pools {
        info!(
            "  {} pool: {} (user {}, proxy port {})",
            label.to_uppercase(),
            pool.endpoint(),
            pool.user,
            ports.for_label(label)
        );
    }
    info!("  Dashboard on: 0.0.0.0:{}", args.dashboard_port);
    info!("  Reload API on: {} (internal only)", args.reload_addr);

    let sharelog = ShareLog::open(&args.db_path)?;
    let labels: Vec<String> = config.pools.keys().cloned().collect();
    let server = Arc::new(ProxyServer::new(config, args.config.clone(), ports, sharelog));

    // Internal reload API
    let reload_listener = TcpListener::bind(args.reload_addr).await?;
    let reload = reload_app(server.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(reload_listener, reload).await {
            error!("Reload API server failed: {}", e);
        }
    });

    // One Stratum listener per configured pool label
    for label in labels {
        let listener = server.bind_listener(&label).await?;
        tokio::spawn(server.clone().accept_loop(listener, label));
    }

    // Dashboard
    let dashboard_listener =
        TcpListener::bind(("0.0.0.0", args.dashboard_port)).await?;
    info!("Dashboard available at http://0.0.0.0:{}", args.dashboard_port);
    let dashboard = dashboard_app(server.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(dashboard_listener, dashboard).await {
            error!("Dashboard server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
