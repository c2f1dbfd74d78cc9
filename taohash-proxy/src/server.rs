use crate::{
    config::{ListenPorts, ProxyConfig},
    session::MinerSession,
    sharelog::ShareLog,
    stats::StatsRegistry,
};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

/// Pool information served by `GET /api/pool`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub url: String,
    pub user: String,
    pub connected_since: i64,
}

/// Supervisor owning the proxy's shared state: the hot-swappable config, the
/// stats registry, the share log, and the set of live session tasks.
///
/// Sessions bind to their pool descriptor at accept time, so a config swap
/// never changes a session mid-flight; reload tears the old sessions down in
/// the background instead.
pub struct ProxyServer {
    config: ArcSwap<ProxyConfig>,
    config_path: PathBuf,
    ports: ListenPorts,
    stats: Arc<StatsRegistry>,
    sharelog: Arc<ShareLog>,
    sessions: Mutex<HashMap<u64, AbortHandle>>,
    next_session_id: AtomicU64,
    started_at: i64,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        config_path: PathBuf,
        ports: ListenPorts,
        sharelog: ShareLog,
    ) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path,
            ports,
            stats: Arc::new(StatsRegistry::new()),
            sharelog: Arc::new(sharelog),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            started_at: Utc::now().timestamp(),
        }
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.load_full()
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn sharelog(&self) -> &ShareLog {
        &self.sharelog
    }

    pub fn ports(&self) -> ListenPorts {
        self.ports
    }

    /// Info about the pool new connections currently bind to. The `normal`
    /// entry is the canonical answer; the first label wins otherwise.
    pub fn pool_info(&self) -> PoolInfo {
        let config = self.config.load();
        let descriptor = config
            .pools
            .get("normal")
            .or_else(|| config.pools.values().next());

        match descriptor {
            Some(pool) => PoolInfo {
                url: pool.endpoint(),
                user: pool.user.clone(),
                connected_since: self.started_at,
            },
            None => PoolInfo {
                url: "Not connected".to_string(),
                user: "N/A".to_string(),
                connected_since: 0,
            },
        }
    }

    /// Reload the on-disk config, swap it in atomically, and schedule
    /// teardown of the sessions bound to the old config.
    ///
    /// Returns as soon as the swap is committed; session teardown happens in
    /// the background. An unchanged config is a no-op beyond the log line,
    /// so repeated reloads cause no session churn.
    pub fn reload(&self) -> Result<()> {
        let new_config = ProxyConfig::load(&self.config_path)?;

        if *self.config.load_full() == new_config {
            info!("Configuration unchanged, keeping active sessions");
            return Ok(());
        }

        info!("Configuration reloaded: {:?}", new_config.pools.keys());
        self.config.store(Arc::new(new_config));

        let sessions: Vec<(u64, AbortHandle)> = self.sessions.lock().drain().collect();
        tokio::spawn(async move {
            let count = sessions.len();
            for (_, handle) in sessions {
                handle.abort();
            }
            info!(
                "Scheduled closure of {} sessions. New connections will use updated config.",
                count
            );
        });

        Ok(())
    }

    /// Accept connections on `listener` and serve each under the pool that
    /// `label` maps to in the config current at accept time. This is the
    /// only place upstream selection happens.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, label: String) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.clone().handle_connection(stream, peer, label.clone()),
                Err(e) => {
                    error!("Failed to accept connection on {} listener: {}", label, e);
                }
            }
        }
    }

    /// Bind the listener for `label` on its configured port.
    pub async fn bind_listener(&self, label: &str) -> Result<TcpListener> {
        let port = self.ports.for_label(label);
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind {label} listener on port {port}"))?;
        info!(
            "{} pool proxy listening on 0.0.0.0:{}",
            label.to_uppercase(),
            port
        );
        Ok(listener)
    }

    fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, label: String) {
        let config = self.config.load();
        let Some(pool) = config.pools.get(&label).cloned() else {
            warn!(
                "No pool configured for label {}; dropping connection from {}",
                label, peer
            );
            return;
        };

        info!(
            "Miner connected: {} -> {} pool ({})",
            peer,
            label,
            pool.endpoint()
        );

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let stats = self.stats.register(peer);
        let session = MinerSession::new(peer, pool, label, stats, self.sharelog.clone());

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let run_handle = tokio::spawn(session.run(stream));
        self.sessions.lock().insert(session_id, run_handle.abort_handle());

        // The watcher outlives an abort, so stats and the session entry are
        // released even when reload kills the task.
        let server = self.clone();
        tokio::spawn(async move {
            let _ = run_handle.await;
            server.sessions.lock().remove(&session_id);
            server.stats.unregister(&peer);
            info!("Miner disconnected: {}", peer);
        });
    }

    /// Number of live session tasks, as tracked by the registry.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
