use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Bound on the recent-shares window used for hashrate estimation.
const RECENT_SHARES_CAPACITY: usize = 100;

/// Trailing window for hashrate estimation, in seconds.
const HASHRATE_WINDOW_SECS: i64 = 300;

/// Minimum shares inside the window for the estimate to be meaningful.
const HASHRATE_MIN_SHARES: usize = 10;

/// Statistics tracker for an individual miner connection.
///
/// Stores connection details, share counts, and estimates hashrate from the
/// recent shares using the difficulty-adjusted share method.
#[derive(Debug)]
pub struct MinerStats {
    /// Miner's IP address
    pub ip: String,

    /// Worker name from mining.authorize
    pub worker_name: Option<String>,

    /// Connection timestamp (unix seconds)
    pub connected_at: i64,

    /// Count of accepted shares
    pub accepted: u64,

    /// Count of rejected shares
    pub rejected: u64,

    /// Effective difficulty currently signalled to the miner
    pub difficulty: f64,

    /// Pool's requested difficulty, which may differ when the local minimum
    /// overrides it
    pub pool_difficulty: f64,

    /// Pool label (`normal` / `high_diff`)
    pub pool_type: Option<String>,

    /// Last known pool address string
    pub pool: Option<String>,

    /// (timestamp, difficulty) of recent accepted shares
    recent_shares: VecDeque<(i64, f64)>,
}

impl MinerStats {
    fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            worker_name: None,
            connected_at: Utc::now().timestamp(),
            accepted: 0,
            rejected: 0,
            difficulty: 1.0,
            pool_difficulty: 1.0,
            pool_type: None,
            pool: None,
            recent_shares: VecDeque::with_capacity(RECENT_SHARES_CAPACITY),
        }
    }

    /// Record a submitted share and its verdict.
    pub fn record_share(&mut self, accepted: bool, difficulty: f64, pool: &str) {
        self.pool = Some(pool.to_string());
        if accepted {
            self.accepted += 1;
            if self.recent_shares.len() == RECENT_SHARES_CAPACITY {
                self.recent_shares.pop_front();
            }
            self.recent_shares
                .push_back((Utc::now().timestamp(), difficulty));
            debug!("Accepted share from {} at difficulty {}", self.ip, difficulty);
        } else {
            self.rejected += 1;
            debug!("Rejected share from {} at difficulty {}", self.ip, difficulty);
        }
    }

    /// Update the effective difficulty currently in force for this miner.
    pub fn update_difficulty(&mut self, difficulty: f64) {
        debug!("Updated difficulty for {} to {}", self.ip, difficulty);
        self.difficulty = difficulty;
    }

    /// Worker name portion after the last `.`, used in log lines.
    pub fn short_worker_name(&self) -> Option<&str> {
        let name = self.worker_name.as_deref()?;
        Some(name.rsplit('.').next().unwrap_or(name))
    }

    /// Estimated hashrate in hashes per second over the trailing 5-minute
    /// window: `Σdifficulty · 2³² / 300`. Returns 0 when fewer than 10
    /// shares lie inside the window.
    pub fn hashrate(&self) -> f64 {
        self.hashrate_at(Utc::now().timestamp())
    }

    fn hashrate_at(&self, now: i64) -> f64 {
        let cutoff = now - HASHRATE_WINDOW_SECS;
        let recent: Vec<f64> = self
            .recent_shares
            .iter()
            .filter(|(ts, _)| *ts > cutoff)
            .map(|(_, diff)| *diff)
            .collect();

        if recent.len() < HASHRATE_MIN_SHARES {
            return 0.0;
        }

        let total_hashes: f64 = recent.iter().sum::<f64>() * 2f64.powi(32);
        total_hashes / HASHRATE_WINDOW_SECS as f64
    }
}

/// One row of the dashboard's `/api/stats` array.
#[derive(Debug, Clone, Serialize)]
pub struct MinerSnapshot {
    pub miner: String,
    pub worker: String,
    pub accepted: u64,
    pub rejected: u64,
    pub difficulty: f64,
    pub pool_difficulty: f64,
    pub hashrate: f64,
    pub pool_type: String,
    pub pool: String,
}

/// Central registry of all connected miner statistics.
///
/// Each session mutates only its own entry; the dashboard aggregates over a
/// snapshot of the map.
#[derive(Default)]
pub struct StatsRegistry {
    miners: RwLock<HashMap<String, Arc<Mutex<MinerStats>>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new miner connection and hand back its stats handle.
    pub fn register(&self, peer: SocketAddr) -> Arc<Mutex<MinerStats>> {
        let key = peer.to_string();
        let stats = Arc::new(Mutex::new(MinerStats::new(&peer.ip().to_string())));
        self.miners.write().insert(key.clone(), stats.clone());
        debug!("Registered miner: {}", key);
        stats
    }

    /// Drop a miner from the registry on disconnect.
    pub fn unregister(&self, peer: &SocketAddr) {
        let key = peer.to_string();
        self.miners.write().remove(&key);
        debug!("Unregistered miner: {}", key);
    }

    pub fn len(&self) -> usize {
        self.miners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.read().is_empty()
    }

    /// Snapshot of every connected miner, for the dashboard.
    pub fn snapshot(&self) -> Vec<MinerSnapshot> {
        let handles: Vec<(String, Arc<Mutex<MinerStats>>)> = self
            .miners
            .read()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.clone()))
            .collect();

        handles
            .into_iter()
            .map(|(key, stats)| {
                let stats = stats.lock();
                MinerSnapshot {
                    miner: key,
                    worker: stats.worker_name.clone().unwrap_or_default(),
                    accepted: stats.accepted,
                    rejected: stats.rejected,
                    difficulty: stats.difficulty,
                    pool_difficulty: stats.pool_difficulty,
                    hashrate: stats.hashrate(),
                    pool_type: stats.pool_type.clone().unwrap_or_else(|| "UNKNOWN".to_string()),
                    pool: stats.pool.clone().unwrap_or_default(),
                }
            })
            .collect()
    }
}
