//! Wire types for the upstream Live API.
//!
//! Minimal serde structures for the setup handshake plus helpers that
//! build and normalize `realtime_input` frames. The upstream accepts both
//! camelCase and snake_case member names; everything the proxy sends uses
//! the snake_case form so client frames of either casing converge.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::UpstreamConfig;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionResumption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Session setup message body.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,
}

/// Build the one-per-connect setup payload.
pub fn setup_message(
    cfg: &UpstreamConfig,
    handle: Option<&str>,
    snapshot: Option<&Value>,
) -> Value {
    let setup = LiveSetup {
        model: cfg.model_path(),
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: cfg.voice_name.clone(),
                    },
                },
            }),
        }),
        system_instruction: cfg.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text.clone()),
            }],
        }),
        output_audio_transcription: Some(json!({})),
        input_audio_transcription: Some(json!({})),
        session_resumption: handle.map(|h| SessionResumption {
            handle: Some(h.to_string()),
        }),
        session: snapshot.cloned(),
    };
    json!({ "setup": setup })
}

/// Wrap raw client PCM as a `realtime_input.media_chunks` frame.
pub fn realtime_audio_message(bytes: &[u8], mime: &str) -> Value {
    json!({
        "realtime_input": {
            "media_chunks": [{
                "mime_type": mime,
                "data": BASE64.encode(bytes),
            }]
        }
    })
}

/// Wrap plain client text as a `realtime_input.text` frame.
pub fn realtime_text_message(text: &str) -> Value {
    json!({ "realtime_input": { "text": text } })
}

/// Detect a bare audio envelope: a `data` string next to an audio MIME.
pub fn audio_envelope(value: &Value) -> Option<(String, String)> {
    let obj = value.as_object()?;
    let data = obj.get("data")?.as_str()?;
    let mime = obj
        .get("mimeType")
        .or_else(|| obj.get("mime_type"))?
        .as_str()?;
    if !mime.starts_with("audio") {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Normalize a client JSON frame so any `realtimeInput`/`realtime_input`
/// member reaches upstream in the snake_case form. Frames without that
/// member pass through unchanged.
pub fn normalize_realtime_input(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let inner = obj.get("realtimeInput").or_else(|| obj.get("realtime_input"));
    let Some(inner) = inner else {
        return value.clone();
    };
    json!({ "realtime_input": normalize_members(inner) })
}

fn normalize_members(inner: &Value) -> Value {
    let Some(map) = inner.as_object() else {
        return inner.clone();
    };
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        let snake = match key.as_str() {
            "mediaChunks" => "media_chunks",
            "activityStart" => "activity_start",
            "activityEnd" => "activity_end",
            "audioStreamEnd" => "audio_stream_end",
            other => other,
        };
        let value = if snake == "media_chunks" {
            normalize_chunks(value)
        } else {
            value.clone()
        };
        out.insert(snake.to_string(), value);
    }
    Value::Object(out)
}

fn normalize_chunks(chunks: &Value) -> Value {
    let Some(items) = chunks.as_array() else {
        return chunks.clone();
    };
    Value::Array(
        items
            .iter()
            .map(|item| {
                let Some(map) = item.as_object() else {
                    return item.clone();
                };
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let snake = if key == "mimeType" { "mime_type" } else { key.as_str() };
                    out.insert(snake.to_string(), value.clone());
                }
                Value::Object(out)
            })
            .collect(),
    )
}
