//! Error types for the proxy.

use thiserror::Error;

/// Errors raised by the upstream connection layer.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream not configured")]
    NotConfigured,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
