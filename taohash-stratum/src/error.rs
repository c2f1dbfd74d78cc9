use thiserror::Error;

/// Errors produced while connecting to or speaking with an upstream pool.
#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Handshake timeout: {0}")]
    HandshakeTimeout(String),

    #[error("Pool rejected authorization: {0}")]
    AuthRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] tokio_util::codec::LinesCodecError),
}

pub type Result<T> = std::result::Result<T, StratumError>;
