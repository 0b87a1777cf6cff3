//! Per-client proxy session.
//!
//! One task per connected client. The loop selects over client frames,
//! upstream frames, and the session's timers (heartbeat, planned
//! reconnect, retry backoff, turn finalization). All state lives on this
//! task; the segmenter and upstream session are owned here and everything
//! downstream goes out through the single client sink.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::audio_extract::{self, AudioChunk};
use crate::config::Config;
use crate::error::UpstreamError;
use crate::events::{SegEvent, UpstreamClosed};
use crate::metrics::{self, Metrics};
use crate::segmenter::Segmenter;
use crate::upstream::{CloseDecision, UpstreamReader, UpstreamSession, MAX_CLOSE_REASON_BYTES};
use crate::util;

pub type ClientWs = WebSocketStream<TcpStream>;
type ClientSink = SplitSink<ClientWs, Message>;

/// Drive one client session to completion.
pub async fn run_session(ws: ClientWs, cfg: Config, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let session_id = util::hex_id(6);
    info!(session = %session_id, "client session started");

    let (mut client_sink, mut client_stream) = ws.split();
    let mut segmenter = Segmenter::new(cfg.segmenter.clone(), metrics.clone(), session_id.clone());
    let mut upstream = UpstreamSession::new(cfg.upstream.clone(), metrics.clone());

    if !upstream.is_configured() {
        let _ = client_sink
            .send(Message::Text(
                json!({ "error": "upstream_not_configured" }).to_string(),
            ))
            .await;
        let _ = client_sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(1011),
                reason: "upstream_not_configured".into(),
            })))
            .await;
        return Ok(());
    }

    let mut upstream_reader: Option<UpstreamReader> = None;
    match upstream.connect(Instant::now()).await {
        Ok(reader) => upstream_reader = Some(reader),
        Err(e) => {
            warn!(session = %session_id, error = %e, "initial upstream connect failed");
            upstream.schedule_retry(Instant::now());
        }
    }

    loop {
        tokio::select! {
            frame = client_stream.next() => {
                let now = Instant::now();
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        upstream.forward_client_audio(&bytes, now).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        upstream.forward_client_text(&text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session = %session_id, "client disconnected");
                        let events = segmenter.force_complete();
                        forward_events(&mut client_sink, &events, &metrics).await;
                        upstream.close(1000, "client_disconnect").await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "client socket error");
                        let events = segmenter.force_complete();
                        forward_events(&mut client_sink, &events, &metrics).await;
                        upstream.close(1000, "client_error").await;
                        break;
                    }
                }
            }

            msg = next_upstream(&mut upstream_reader) => {
                let now = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        process_upstream_text(
                            &text,
                            &mut client_sink,
                            &mut upstream,
                            &mut segmenter,
                            &metrics,
                            now,
                        )
                        .await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        // Valid UTF-8 reclassifies as text; raw bytes are PCM.
                        match String::from_utf8(bytes) {
                            Ok(text) => {
                                process_upstream_text(
                                    &text,
                                    &mut client_sink,
                                    &mut upstream,
                                    &mut segmenter,
                                    &metrics,
                                    now,
                                )
                                .await;
                            }
                            Err(err) => {
                                let bytes = err.into_bytes();
                                send_client(&mut client_sink, Message::Binary(bytes.clone()), &metrics)
                                    .await;
                                metrics::incr(&metrics.frames_forwarded);
                                let chunk = AudioChunk {
                                    bytes,
                                    mime: Some(format!(
                                        "audio/pcm;rate={}",
                                        cfg.segmenter.sample_rate
                                    )),
                                };
                                let events = segmenter.ingest(None, &[chunk], now);
                                forward_events(&mut client_sink, &events, &metrics).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        upstream_reader = None;
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1006, String::new()));
                        if handle_upstream_close(
                            &mut client_sink,
                            &mut upstream,
                            &mut segmenter,
                            &metrics,
                            code,
                            &reason,
                            now,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        upstream_reader = None;
                        let reason = e.to_string();
                        if handle_upstream_close(
                            &mut client_sink,
                            &mut upstream,
                            &mut segmenter,
                            &metrics,
                            1006,
                            &reason,
                            now,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    None => {
                        upstream_reader = None;
                        if handle_upstream_close(
                            &mut client_sink,
                            &mut upstream,
                            &mut segmenter,
                            &metrics,
                            1006,
                            "",
                            now,
                        )
                        .await
                        {
                            break;
                        }
                    }
                }
            }

            _ = sleep_until_opt(upstream.heartbeat_at()) => {
                upstream.on_heartbeat(Instant::now()).await;
            }

            _ = sleep_until_opt(upstream.planned_reconnect_at()) => {
                upstream.begin_drain().await;
            }

            _ = sleep_until_opt(upstream.retry_at()) => {
                match upstream.connect(Instant::now()).await {
                    Ok(reader) => {
                        info!(session = %session_id, "upstream reconnected");
                        upstream_reader = Some(reader);
                    }
                    Err(UpstreamError::NotConfigured) => {
                        warn!(session = %session_id, "upstream configuration lost");
                        break;
                    }
                    Err(e) => {
                        let delay = upstream.schedule_retry(Instant::now());
                        warn!(
                            session = %session_id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "upstream reconnect failed"
                        );
                    }
                }
            }

            _ = sleep_until_opt(segmenter.finalize_deadline()) => {
                let events = segmenter.on_finalize_timer(Instant::now());
                forward_events(&mut client_sink, &events, &metrics).await;
            }
        }
    }

    info!(session = %session_id, totals = %metrics.snapshot(), "session ended");
    Ok(())
}

/// One upstream JSON frame: harvest audio, pass the sanitized payload
/// through, feed the segmenter, and watch for goAway / resumption state.
async fn process_upstream_text(
    text: &str,
    client_sink: &mut ClientSink,
    upstream: &mut UpstreamSession,
    segmenter: &mut Segmenter,
    metrics: &Arc<Metrics>,
    now: Instant,
) {
    let payload: Value = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(_) => {
            // Not JSON; forward verbatim.
            send_client(client_sink, Message::Text(text.to_string()), metrics).await;
            return;
        }
    };

    let migration = upstream.observe_payload(&payload);
    if payload_mentions_rate_limit(&payload) {
        upstream.mark_rate_limited(now);
    }
    let go_away = audio_extract::detect_go_away(&payload);

    let (chunks, sanitized) = audio_extract::extract_audio(&payload);
    for chunk in &chunks {
        send_client(client_sink, Message::Binary(chunk.bytes.clone()), metrics).await;
        metrics::incr(&metrics.frames_forwarded);
    }
    send_client(client_sink, Message::Text(sanitized.to_string()), metrics).await;

    let events = segmenter.ingest(Some(&payload), &chunks, now);
    forward_events(client_sink, &events, metrics).await;

    if go_away {
        debug!("upstream goAway observed");
        upstream.begin_drain().await;
    } else if migration {
        debug!("resumption update suggests migration");
        upstream.begin_drain().await;
    }
}

/// Handle an upstream close. Returns true when the session must end.
async fn handle_upstream_close(
    client_sink: &mut ClientSink,
    upstream: &mut UpstreamSession,
    segmenter: &mut Segmenter,
    metrics: &Arc<Metrics>,
    code: u16,
    reason: &str,
    now: Instant,
) -> bool {
    match upstream.handle_close(code, reason, now) {
        CloseDecision::Retry { .. } => false,
        CloseDecision::Terminal { code, reason } => {
            let events = segmenter.force_complete();
            forward_events(client_sink, &events, metrics).await;

            let notice = UpstreamClosed::new(code, reason.clone());
            if let Ok(text) = serde_json::to_string(&notice) {
                send_client(client_sink, Message::Text(text), metrics).await;
            }
            let close_code = downstream_close_code(code);
            let _ = client_sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(close_code),
                    reason: util::truncate_reason(&reason, MAX_CLOSE_REASON_BYTES).into(),
                })))
                .await;
            true
        }
    }
}

/// Terminal upstream closes map onto the downstream vocabulary: clean
/// closes pass through, everything else is a server fault.
fn downstream_close_code(upstream_code: u16) -> u16 {
    match upstream_code {
        1000 => 1000,
        1012 => 1012,
        _ => 1011,
    }
}

/// 429-like errors buried in a payload body.
fn payload_mentions_rate_limit(payload: &Value) -> bool {
    let Some(error) = payload.get("error") else {
        return false;
    };
    if error.get("code").and_then(Value::as_i64) == Some(429) {
        return true;
    }
    if error
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s == "RESOURCE_EXHAUSTED")
        .unwrap_or(false)
    {
        return true;
    }
    error
        .get("message")
        .and_then(Value::as_str)
        .map(|m| m.contains("429"))
        .unwrap_or(false)
}

async fn forward_events(sink: &mut ClientSink, events: &[SegEvent], metrics: &Arc<Metrics>) {
    for event in events {
        match serde_json::to_string(event) {
            Ok(text) => send_client(sink, Message::Text(text), metrics).await,
            Err(e) => warn!(error = %e, "event serialization failed"),
        }
    }
}

async fn send_client(sink: &mut ClientSink, msg: Message, metrics: &Arc<Metrics>) {
    if let Err(e) = sink.send(msg).await {
        debug!(error = %e, "client send failed");
        metrics::incr(&metrics.send_failures);
    }
}

/// Pend forever when no deadline is armed, so disarmed timers never win
/// the select.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Await the upstream reader if connected, pend otherwise.
async fn next_upstream(
    reader: &mut Option<UpstreamReader>,
) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
