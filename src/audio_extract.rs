//! Harvesting audio out of nested upstream payloads.
//!
//! Upstream frames bury base64 PCM under several shapes (`inlineData`,
//! `realtimeOutput.audio`, `media_chunks`, both casings). The extractor
//! walks the tree, decodes every audio chunk it recognizes, and returns a
//! sanitized clone where each harvested `data` string is replaced by a
//! `{"sizeBytes": n}` marker so the payload can be forwarded downstream
//! without re-shipping the audio as JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

const MAX_WALK_DEPTH: usize = 12;

/// Object keys that mark their subtree as audio-bearing.
const AUDIO_CONTAINER_KEYS: &[&str] = &[
    "audio",
    "inlineData",
    "inline_data",
    "realtimeOutput",
    "realtime_output",
    "mediaChunks",
    "media_chunks",
];

/// One decoded audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

/// Walk a payload, harvesting audio chunks and producing a sanitized clone.
pub fn extract_audio(payload: &Value) -> (Vec<AudioChunk>, Value) {
    let mut chunks = Vec::new();
    let sanitized = sanitize(payload, 0, false, &mut chunks);
    (chunks, sanitized)
}

fn sanitize(node: &Value, depth: usize, in_audio: bool, chunks: &mut Vec<AudioChunk>) -> Value {
    if depth > MAX_WALK_DEPTH {
        return node.clone();
    }
    match node {
        Value::Object(map) => {
            let mime = object_mime(map);
            let audio_here = in_audio
                || mime.as_deref().map(|m| m.starts_with("audio")).unwrap_or(false);

            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if key == "data" && audio_here && mime_allows_audio(mime.as_deref()) {
                    if let Some(decoded) = value.as_str().and_then(|s| BASE64.decode(s).ok()) {
                        out.insert(key.clone(), json!({ "sizeBytes": decoded.len() }));
                        chunks.push(AudioChunk {
                            bytes: decoded,
                            mime: mime.clone(),
                        });
                        continue;
                    }
                }
                let child_audio = audio_here || AUDIO_CONTAINER_KEYS.contains(&key.as_str());
                out.insert(key.clone(), sanitize(value, depth + 1, child_audio, chunks));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize(item, depth + 1, in_audio, chunks))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn object_mime(map: &Map<String, Value>) -> Option<String> {
    map.get("mimeType")
        .or_else(|| map.get("mime_type"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// A declared non-audio mime (e.g. image/jpeg) vetoes harvesting even
/// inside an audio-marked subtree.
fn mime_allows_audio(mime: Option<&str>) -> bool {
    match mime {
        Some(m) => m.starts_with("audio"),
        None => true,
    }
}

/// Whether a payload carries an upstream go-away signal anywhere.
pub fn detect_go_away(payload: &Value) -> bool {
    fn truthy(v: &Value) -> bool {
        !matches!(v, Value::Null | Value::Bool(false))
    }
    fn walk(node: &Value, depth: usize) -> bool {
        if depth > MAX_WALK_DEPTH {
            return false;
        }
        match node {
            Value::String(s) => s.eq_ignore_ascii_case("goaway"),
            Value::Object(map) => map.iter().any(|(key, value)| {
                ((key == "goAway" || key == "go_away") && truthy(value))
                    || walk(value, depth + 1)
            }),
            Value::Array(items) => items.iter().any(|item| walk(item, depth + 1)),
            _ => false,
        }
    }
    walk(payload, 0)
}

/// Pull a session-resumption handle out of a payload, if present.
pub fn resumption_handle(payload: &Value) -> Option<String> {
    for update_key in [
        "sessionResumptionUpdate",
        "session_resumption_update",
        "sessionResumption",
        "session_resumption",
    ] {
        if let Some(update) = payload.get(update_key) {
            for handle_key in ["newHandle", "new_handle", "handle"] {
                if let Some(handle) = update.get(handle_key).and_then(Value::as_str) {
                    if !handle.is_empty() {
                        return Some(handle.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Whether a resumption update marks the session as safely resumable.
pub fn resumption_resumable(payload: &Value) -> bool {
    for update_key in [
        "sessionResumptionUpdate",
        "session_resumption_update",
        "sessionResumption",
        "session_resumption",
    ] {
        if let Some(update) = payload.get(update_key) {
            if update.get("resumable").and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }
    }
    false
}

/// The opaque `session` snapshot upstream wants echoed back on reconnect.
pub fn session_snapshot(payload: &Value) -> Option<Value> {
    payload.get("session").cloned().filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn test_harvests_inline_data() {
        let pcm = vec![1u8, 2, 3, 4];
        let payload = json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": b64(&pcm) } }
            ]}}
        });
        let (chunks, sanitized) = extract_audio(&payload);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].bytes, pcm);
        assert_eq!(chunks[0].mime.as_deref(), Some("audio/pcm;rate=24000"));

        let marker = &sanitized["serverContent"]["modelTurn"]["parts"][0]["inlineData"]["data"];
        assert_eq!(marker["sizeBytes"], 4);
    }

    #[test]
    fn test_harvests_snake_case_realtime_output() {
        let payload = json!({
            "realtime_output": { "audio": { "data": b64(&[9, 9]) } }
        });
        let (chunks, sanitized) = extract_audio(&payload);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].bytes, vec![9, 9]);
        assert_eq!(
            sanitized["realtime_output"]["audio"]["data"]["sizeBytes"],
            2
        );
    }

    #[test]
    fn test_non_audio_mime_left_alone() {
        let payload = json!({
            "inlineData": { "mimeType": "image/jpeg", "data": b64(&[1, 2, 3]) }
        });
        let (chunks, sanitized) = extract_audio(&payload);
        assert!(chunks.is_empty());
        assert!(sanitized["inlineData"]["data"].is_string());
    }

    #[test]
    fn test_invalid_base64_ignored() {
        let payload = json!({ "audio": { "data": "!!not-base64!!" } });
        let (chunks, sanitized) = extract_audio(&payload);
        assert!(chunks.is_empty());
        assert_eq!(sanitized["audio"]["data"], "!!not-base64!!");
    }

    #[test]
    fn test_plain_data_outside_audio_context_kept() {
        let payload = json!({ "metadata": { "data": b64(&[7, 7, 7]) } });
        let (chunks, _) = extract_audio(&payload);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_multiple_chunks_in_order() {
        let payload = json!({
            "media_chunks": [
                { "mime_type": "audio/pcm;rate=24000", "data": b64(&[1]) },
                { "mime_type": "audio/pcm;rate=24000", "data": b64(&[2]) }
            ]
        });
        let (chunks, _) = extract_audio(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].bytes, vec![1]);
        assert_eq!(chunks[1].bytes, vec![2]);
    }

    #[test]
    fn test_go_away_detection() {
        assert!(detect_go_away(&json!({ "goAway": {} })));
        assert!(detect_go_away(&json!({ "go_away": { "timeLeft": "10s" } })));
        assert!(detect_go_away(&json!({ "status": "GOAWAY" })));
        assert!(detect_go_away(&json!({ "nested": { "deep": "goaway" } })));
        assert!(!detect_go_away(&json!({ "goAway": false })));
        assert!(!detect_go_away(&json!({ "status": "ok" })));
    }

    #[test]
    fn test_resumption_handle_variants() {
        assert_eq!(
            resumption_handle(&json!({ "sessionResumptionUpdate": { "newHandle": "h1" } })),
            Some("h1".to_string())
        );
        assert_eq!(
            resumption_handle(&json!({ "session_resumption_update": { "handle": "h2" } })),
            Some("h2".to_string())
        );
        assert_eq!(resumption_handle(&json!({ "sessionResumptionUpdate": { "newHandle": "" } })), None);
        assert_eq!(resumption_handle(&json!({})), None);
    }

    #[test]
    fn test_resumption_resumable_flag() {
        assert!(resumption_resumable(&json!({
            "sessionResumptionUpdate": { "newHandle": "h", "resumable": true }
        })));
        assert!(resumption_resumable(&json!({
            "session_resumption_update": { "resumable": true }
        })));
        assert!(!resumption_resumable(&json!({
            "sessionResumptionUpdate": { "newHandle": "h", "resumable": false }
        })));
        assert!(!resumption_resumable(&json!({
            "sessionResumptionUpdate": { "newHandle": "h" }
        })));
        assert!(!resumption_resumable(&json!({})));
    }

    #[test]
    fn test_session_snapshot() {
        assert_eq!(
            session_snapshot(&json!({ "session": { "handle": "x" } })),
            Some(json!({ "handle": "x" }))
        );
        assert_eq!(session_snapshot(&json!({ "session": null })), None);
        assert_eq!(session_snapshot(&json!({})), None);
    }
}
