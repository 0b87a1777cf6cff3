//! Upstream Live connection: connect, setup, heartbeat, reconnect.
//!
//! One `UpstreamSession` per client session owns the outbound half of the
//! upstream socket and every piece of reconnect state: the jittered retry
//! backoff, the planned-reconnect window, the resumption handle, and the
//! queue of client frames that arrived while the link was down. The read
//! half is handed back to the session loop so it can `select!` on it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::SinkExt;
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::UpstreamConfig;
use crate::error::{Result, UpstreamError};
use crate::limiter::AdaptiveRateLimiter;
use crate::live;
use crate::metrics::{self, Metrics};
use crate::{audio_extract, util};

pub type UpstreamSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type UpstreamReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Close codes after which a reconnect is worth attempting.
const RETRYABLE_CLOSE_CODES: &[u16] = &[1006, 1011, 1012, 1013];

/// Reasons longer than this are truncated before forwarding downstream.
pub const MAX_CLOSE_REASON_BYTES: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Idle,
    Connecting,
    Open,
    Draining,
    Closed,
}

/// What to do after the upstream socket closed.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseDecision {
    Retry { delay: Duration },
    Terminal { code: u16, reason: String },
}

pub struct UpstreamSession {
    cfg: UpstreamConfig,
    metrics: Arc<Metrics>,
    state: UpstreamState,
    sink: Option<UpstreamSink>,

    backoff: Backoff,
    limiter: AdaptiveRateLimiter,

    /// Client frames held while the link is not Open. Oldest dropped at cap.
    pending: VecDeque<Message>,

    resumption_handle: Option<String>,
    session_snapshot: Option<Value>,

    heartbeat_at: Option<Instant>,
    planned_reconnect_at: Option<Instant>,
    retry_at: Option<Instant>,
}

impl UpstreamSession {
    pub fn new(cfg: UpstreamConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            state: UpstreamState::Idle,
            sink: None,
            backoff: Backoff::reconnect(),
            limiter: AdaptiveRateLimiter::new(),
            pending: VecDeque::new(),
            resumption_handle: None,
            session_snapshot: None,
            heartbeat_at: None,
            planned_reconnect_at: None,
            retry_at: None,
        }
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.cfg.endpoint().is_some()
    }

    pub fn resumption_handle(&self) -> Option<&str> {
        self.resumption_handle.as_deref()
    }

    pub fn heartbeat_at(&self) -> Option<Instant> {
        self.heartbeat_at
    }

    pub fn planned_reconnect_at(&self) -> Option<Instant> {
        self.planned_reconnect_at
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Connect and run the setup handshake. Returns the read half.
    pub async fn connect(&mut self, now: Instant) -> Result<UpstreamReader> {
        let Some(endpoint) = self.cfg.endpoint() else {
            self.state = UpstreamState::Closed;
            return Err(UpstreamError::NotConfigured);
        };
        self.state = UpstreamState::Connecting;
        self.retry_at = None;

        info!(attempt = self.backoff.attempt(), "connecting upstream");
        let (ws, _resp) = connect_async(&endpoint).await?;
        let (sink, stream) = futures_util::StreamExt::split(ws);
        self.sink = Some(sink);

        let setup = live::setup_message(
            &self.cfg,
            self.resumption_handle.as_deref(),
            self.session_snapshot.as_ref(),
        );
        self.send_now(Message::Text(setup.to_string())).await?;
        if self.resumption_handle.is_some() {
            metrics::incr(&self.metrics.resumed_connections);
        }

        self.state = UpstreamState::Open;
        self.backoff.reset();
        self.flush_pending().await;

        if self.cfg.heartbeat_interval_ms > 0 {
            self.heartbeat_at = Some(now + Duration::from_millis(self.cfg.heartbeat_interval_ms));
        }
        let window = rand::thread_rng()
            .gen_range(self.cfg.planned_reconnect_min_ms..=self.cfg.planned_reconnect_max_ms.max(self.cfg.planned_reconnect_min_ms));
        self.planned_reconnect_at = Some(now + Duration::from_millis(window));
        info!(planned_in_ms = window, "upstream open");
        Ok(stream)
    }

    /// A connect attempt failed; schedule the next one.
    pub fn schedule_retry(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        self.state = UpstreamState::Connecting;
        delay
    }

    /// Cooperative reconnect: tell upstream we are leaving, keep state for
    /// the follow-up connection.
    pub async fn begin_drain(&mut self) {
        if self.state != UpstreamState::Open {
            return;
        }
        info!("draining upstream for planned reconnect");
        self.state = UpstreamState::Draining;
        self.planned_reconnect_at = None;
        self.heartbeat_at = None;
        let frame = CloseFrame {
            code: CloseCode::from(1012),
            reason: "planned_reconnect".into(),
        };
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                warn!(error = %e, "drain close failed");
            }
        }
    }

    /// The upstream socket closed. Decides between reconnect and terminal.
    pub fn handle_close(&mut self, code: u16, reason: &str, now: Instant) -> CloseDecision {
        self.sink = None;
        self.heartbeat_at = None;
        self.planned_reconnect_at = None;

        if reason.contains("429") {
            self.limiter.mark_rate_limited(now);
        }

        let draining = self.state == UpstreamState::Draining;
        if draining || is_retryable_close(code, reason) {
            metrics::incr(&self.metrics.reconnects);
            self.state = UpstreamState::Connecting;
            let delay = if draining {
                self.backoff.reset();
                Duration::ZERO
            } else {
                self.backoff.next_delay()
            };
            self.retry_at = Some(now + delay);
            debug!(code, reason, delay_ms = delay.as_millis() as u64, "upstream close, retrying");
            CloseDecision::Retry { delay }
        } else {
            self.state = UpstreamState::Closed;
            CloseDecision::Terminal {
                code,
                reason: util::truncate_reason(reason, MAX_CLOSE_REASON_BYTES),
            }
        }
    }

    /// Close the upstream for good (client went away).
    pub async fn close(&mut self, code: u16, reason: &str) {
        self.heartbeat_at = None;
        self.planned_reconnect_at = None;
        self.retry_at = None;
        if let Some(sink) = &mut self.sink {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: util::truncate_reason(reason, MAX_CLOSE_REASON_BYTES).into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
        self.sink = None;
        self.state = UpstreamState::Closed;
    }

    // ── timers ─────────────────────────────────────────────────────────

    pub async fn on_heartbeat(&mut self, now: Instant) {
        if self.state != UpstreamState::Open {
            self.heartbeat_at = None;
            return;
        }
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                warn!(error = %e, "heartbeat ping failed");
                metrics::incr(&self.metrics.send_failures);
            }
        }
        self.heartbeat_at = Some(now + Duration::from_millis(self.cfg.heartbeat_interval_ms));
    }

    // ── forwarding ─────────────────────────────────────────────────────

    /// Client microphone PCM, throttled by the adaptive limiter.
    pub async fn forward_client_audio(&mut self, bytes: &[u8], now: Instant) {
        if !self.limiter.allow_send(now) {
            metrics::incr(&self.metrics.rate_limited_drops);
            return;
        }
        let msg = live::realtime_audio_message(bytes, &self.cfg.input_mime);
        if self.dispatch(Message::Text(msg.to_string())).await {
            self.limiter.mark_success();
        }
    }

    /// Client text frame: audio envelope, realtime-input JSON, or bare text.
    pub async fn forward_client_text(&mut self, text: &str) {
        let frame = match serde_json::from_str::<Value>(text) {
            Ok(value) if value.is_object() => {
                if let Some((mime, data)) = live::audio_envelope(&value) {
                    serde_json::json!({
                        "realtime_input": {
                            "media_chunks": [{ "mime_type": mime, "data": data }]
                        }
                    })
                } else {
                    live::normalize_realtime_input(&value)
                }
            }
            _ => live::realtime_text_message(text),
        };
        self.dispatch(Message::Text(frame.to_string())).await;
    }

    /// Merge resumption state carried by an upstream payload. Returns true
    /// when the update suggests migrating to a fresh connection: a new
    /// full session snapshot, or a resumable checkpoint that rotates an
    /// already-held handle. Unchanged re-deliveries never re-trigger, so
    /// a drain cannot loop on a repeated update.
    pub fn observe_payload(&mut self, payload: &Value) -> bool {
        let mut migration = false;
        if let Some(handle) = audio_extract::resumption_handle(payload) {
            let rotated = self
                .resumption_handle
                .as_deref()
                .map(|held| held != handle.as_str())
                .unwrap_or(false);
            if rotated && audio_extract::resumption_resumable(payload) {
                migration = true;
            }
            debug!(handle = %handle, rotated, "session resumption handle updated");
            self.resumption_handle = Some(handle);
        }
        if let Some(snapshot) = audio_extract::session_snapshot(payload) {
            if self.session_snapshot.as_ref() != Some(&snapshot) {
                migration = true;
                self.session_snapshot = Some(snapshot);
            }
        }
        migration
    }

    /// Note a 429-like error surfaced inside a payload body.
    pub fn mark_rate_limited(&mut self, now: Instant) {
        self.limiter.mark_rate_limited(now);
    }

    /// Send when Open, queue otherwise. Returns whether the frame went out.
    async fn dispatch(&mut self, msg: Message) -> bool {
        if self.state == UpstreamState::Open {
            self.send_logged(msg).await
        } else {
            self.queue_pending(msg);
            false
        }
    }

    async fn send_logged(&mut self, msg: Message) -> bool {
        match self.send_now(msg).await {
            Ok(()) => true,
            Err(e) => {
                // A single failed send is not fatal; the reader side will
                // observe the close and drive reconnection.
                warn!(error = %e, "upstream send failed");
                metrics::incr(&self.metrics.send_failures);
                false
            }
        }
    }

    async fn send_now(&mut self, msg: Message) -> Result<()> {
        match &mut self.sink {
            Some(sink) => sink.send(msg).await.map_err(UpstreamError::from),
            None => Err(UpstreamError::ConnectionClosed),
        }
    }

    fn queue_pending(&mut self, msg: Message) {
        self.pending.push_back(msg);
        while self.pending.len() > self.cfg.pending_queue_cap {
            self.pending.pop_front();
            metrics::incr(&self.metrics.pending_frames_dropped);
        }
    }

    async fn flush_pending(&mut self) {
        while let Some(msg) = self.pending.pop_front() {
            if !self.send_logged(msg).await {
                break;
            }
        }
    }
}

/// Whether an upstream close is worth a reconnect attempt.
pub fn is_retryable_close(code: u16, reason: &str) -> bool {
    RETRYABLE_CLOSE_CODES.contains(&code)
        || reason.contains("429")
        || reason.trim_start().starts_with('5')
}
