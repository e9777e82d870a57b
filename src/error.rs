//! Crate-wide error taxonomy. One variant group per subsystem boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("pool exhausted (max {max})")]
    PoolExhausted { max: usize },

    #[error("upstream dial failed: {0}")]
    Dial(String),

    #[error("upstream rejected CONNECT: {0}")]
    ConnectRejected(String),

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    #[error("bogus-dns slot assignment exhausted for {host:?}")]
    SlotsExhausted { host: String },

    #[error("bogus-dns lookup failed: {0}")]
    BogusDns(String),

    #[error("gfwlist error: {0}")]
    GfwList(String),

    #[error("{0} not supported on this platform")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
