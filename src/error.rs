//! Error types for the relay client and event cache.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("connection attempt already in progress")]
    AlreadyConnecting,

    #[error("not connected to {0}")]
    NotConnected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("no signer configured")]
    NoSigner,

    #[error("already disposed")]
    Disposed,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Signature(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Signature(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
