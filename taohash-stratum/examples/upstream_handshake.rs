//! Upstream handshake example.
//!
//! Connects to a pool, runs the configure/subscribe/authorize handshake, and
//! prints the session parameters plus whatever the pool pushed before the
//! first job. Replace the pool address and account with real ones.

use taohash_stratum::{user_agent, PoolDescriptor, UpstreamSession};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("taohash_stratum=debug")
        .init();

    let pool = PoolDescriptor {
        host: "stratum.example.com".to_string(),
        port: 3333,
        user: "your_account.worker1".to_string(),
        pass: "x".to_string(),
    };

    info!("Connecting to {}", pool.endpoint());
    let session = UpstreamSession::connect(&pool, None, user_agent()).await?;

    info!(
        "Subscribed: extranonce1={} extranonce2_size={}",
        session.extranonce1, session.extranonce2_size
    );
    for message in &session.pre_auth_messages {
        info!("Buffered from pool: {:?}", message.method());
    }

    Ok(())
}
