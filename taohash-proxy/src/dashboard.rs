use crate::{server::ProxyServer, sharelog::ShareEvent, stats::MinerSnapshot};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Read-only dashboard: HTML page plus the stats/pool/share APIs.
pub fn dashboard_app(server: Arc<ProxyServer>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/stats", get(api_stats))
        .route("/api/pool", get(api_pool))
        .route("/api/shares", get(api_shares))
        .with_state(server)
}

/// Internal control surface, bound to localhost only.
pub fn reload_app(server: Arc<ProxyServer>) -> Router {
    Router::new()
        .route("/api/reload", post(api_reload))
        .with_state(server)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn api_stats(State(server): State<Arc<ProxyServer>>) -> Json<Vec<MinerSnapshot>> {
    Json(server.stats().snapshot())
}

async fn api_pool(State(server): State<Arc<ProxyServer>>) -> Json<crate::server::PoolInfo> {
    Json(server.pool_info())
}

#[derive(Debug, Deserialize)]
struct SharesQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    /// Restrict to one miner identity (`worker@ip:port`), oldest first.
    miner: Option<String>,
    /// With `miner`: only events at or after this unix timestamp.
    since: Option<i64>,
}

async fn api_shares(
    State(server): State<Arc<ProxyServer>>,
    Query(query): Query<SharesQuery>,
) -> Result<Json<Vec<ShareEvent>>, (StatusCode, String)> {
    let result = match query.miner {
        Some(miner) => {
            server
                .sharelog()
                .events_for(&miner, query.since.unwrap_or(0))
                .await
        }
        None => {
            server
                .sharelog()
                .recent(query.limit.unwrap_or(100), query.offset.unwrap_or(0))
                .await
        }
    };
    result
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn api_reload(
    State(server): State<Arc<ProxyServer>>,
) -> Result<&'static str, (StatusCode, String)> {
    info!("Received reload request");
    match server.reload() {
        Ok(()) => Ok("Reload scheduled\n"),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
