//! TaoHash Stratum V1 library
//!
//! Wire types and the upstream pool session used by the TaoHash mining proxy.
//!
//! # Features
//!
//! - Line-delimited JSON Stratum V1 message types with shape classification
//! - Upstream pool handshake: configure negotiation, subscribe, authorize
//! - Legacy-upstream detection via the configure timeout
//! - Buffering of the pool's initial difficulty/job for later replay
//! - Async/await based on Tokio
//!
//! # Example
//!
//! ```no_run
//! use taohash_stratum::{user_agent, PoolDescriptor, UpstreamSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PoolDescriptor {
//!         host: "stratum.example.com".to_string(),
//!         port: 3333,
//!         user: "account.worker".to_string(),
//!         pass: "x".to_string(),
//!     };
//!
//!     let mut session = UpstreamSession::connect(&pool, None, user_agent()).await?;
//!     println!(
//!         "subscribed with extranonce1={} extranonce2_size={}",
//!         session.extranonce1, session.extranonce2_size
//!     );
//!
//!     let _stream = session.take_stream();
//!     // Broker miner traffic over the stream...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod upstream;

// Re-export main types
pub use config::PoolDescriptor;
pub use error::{Result, StratumError};
pub use protocol::{methods, parse_line, StratumMessage, StratumRequest, StratumResponse};
pub use upstream::UpstreamSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-agent string sent in `mining.subscribe` upstream.
pub fn user_agent() -> &'static str {
    concat!("taohash-proxy/", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_user_agent() {
        assert!(user_agent().starts_with("taohash-proxy/"));
    }
}
