//! Error types for each layer of the SDK.

use dslink_protocol::ProtocolError;

/// Node tree structural errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("remote trees are peer-authoritative; nodes cannot be created locally")]
    RemoteTree,
    #[error("invalid node name: {0:?}")]
    InvalidName(String),
    #[error("node already exists: {0}")]
    Exists(String),
    #[error("the super root cannot be removed")]
    RootRemoval,
    #[error("node not found: {0}")]
    NotFound(String),
}

/// Broker handshake failures.  Each one counts as a connection attempt.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("url: {0}")]
    Url(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Transport-level failures.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("send: {0}")]
    Send(String),
    #[error("not connected")]
    NotConnected,
}

/// Snapshot and key file failures.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid key file: {0}")]
    InvalidKey(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("config: {0}")]
    Config(String),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("failed to connect after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
