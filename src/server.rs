//! Downstream WebSocket listener.
//!
//! Accepts client connections and spawns one independent session task per
//! client. Sessions share nothing but the metrics context.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::session;

pub async fn run(cfg: Config, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.server.bind_addr).await?;
    info!(addr = %cfg.server.bind_addr, "listening for client sessions");

    loop {
        let (stream, peer) = listener.accept().await?;
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    if let Err(e) = session::run_session(ws, cfg, metrics).await {
                        warn!(peer = %peer, error = %e, "session failed");
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "websocket handshake failed");
                }
            }
        });
    }
}
