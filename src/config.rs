//! Configuration structures for the proxy.
//!
//! Defaults carry the tuning the system ships with; every knob can be
//! overridden by deserializing a config file or via `Config::from_env`.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub segmenter: SegmenterConfig,
    pub player: PlayerConfig,
    pub caption: CaptionConfig,
}

impl Config {
    /// Build a config from the environment. Unset variables keep defaults.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(bind) = std::env::var("LIVEBRIDGE_BIND") {
            cfg.server.bind_addr = bind;
        }
        if let Ok(key) = std::env::var("LIVEBRIDGE_API_KEY").or_else(|_| std::env::var("GEMINI_API_KEY")) {
            cfg.upstream.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("LIVEBRIDGE_UPSTREAM_URL") {
            cfg.upstream.url = Some(url);
        }
        if let Ok(model) = std::env::var("LIVEBRIDGE_MODEL") {
            cfg.upstream.model = model;
        }
        if let Ok(voice) = std::env::var("LIVEBRIDGE_VOICE") {
            cfg.upstream.voice_name = voice;
        }
        if let Ok(instruction) = std::env::var("LIVEBRIDGE_SYSTEM_INSTRUCTION") {
            cfg.upstream.system_instruction = Some(instruction);
        }
        cfg
    }
}

/// Downstream WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address for the client-facing WebSocket listener.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Upstream Live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Full wss:// endpoint. Takes precedence over `api_key`.
    pub url: Option<String>,
    /// API key used to build the default endpoint when `url` is unset.
    pub api_key: Option<String>,
    /// Model id, sent as `models/<id>` when not already prefixed.
    pub model: String,
    /// Prebuilt voice requested in the setup payload.
    pub voice_name: String,
    /// Optional system instruction.
    pub system_instruction: Option<String>,
    /// MIME type for client microphone audio forwarded upstream.
    pub input_mime: String,
    /// WebSocket ping cadence while Open. 0 disables.
    pub heartbeat_interval_ms: u64,
    /// Planned reconnect window, drawn uniformly per connection.
    pub planned_reconnect_min_ms: u64,
    pub planned_reconnect_max_ms: u64,
    /// Client frames queued while not yet Open; oldest dropped on overflow.
    pub pending_queue_cap: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            model: "gemini-2.0-flash-live-001".to_string(),
            voice_name: "Aoede".to_string(),
            system_instruction: None,
            input_mime: "audio/pcm;rate=16000".to_string(),
            heartbeat_interval_ms: 30_000,
            planned_reconnect_min_ms: 8 * 60 * 1000,
            planned_reconnect_max_ms: 9 * 60 * 1000,
            pending_queue_cap: 256,
        }
    }
}

impl UpstreamConfig {
    /// Resolve the websocket endpoint, if the config allows connecting.
    pub fn endpoint(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        self.api_key.as_ref().map(|key| {
            format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
                key
            )
        })
    }

    /// Model id with the `models/` prefix the wire format wants.
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

/// Segmentation engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmenterConfig {
    /// PCM rate of upstream audio (Hz).
    pub sample_rate: u32,
    /// Amplitude at or below which a sample counts as silence.
    pub silence_threshold: i32,
    /// Minimum run of silence that cuts a segment (ms).
    pub silence_duration_ms: u64,
    /// Cap on silence-split buffers awaiting pairing; oldest dropped.
    pub max_pending_segments: usize,
    /// Duration floor below which adjacent queued audio is merged (ms).
    pub min_segment_ms: u64,
    /// Grace window after a generation-complete signal (ms).
    pub finalize_grace_ms: u64,
    /// Single permitted extension on late activity (ms past the start).
    pub finalize_extend_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            silence_threshold: 750,
            silence_duration_ms: 320,
            max_pending_segments: 8,
            min_segment_ms: 300,
            finalize_grace_ms: 1800,
            finalize_extend_ms: 300,
        }
    }
}

impl SegmenterConfig {
    pub fn min_silence_samples(&self) -> usize {
        (self.silence_duration_ms as u128 * self.sample_rate as u128 / 1000) as usize
    }
}

/// Playback ring tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerConfig {
    /// PCM rate of pushed audio (Hz).
    pub input_rate: u32,
    /// Queue depth required to arm the first time (ms).
    pub initial_queue_ms: u64,
    /// Queue depth required to re-arm after an underrun (ms).
    pub rearm_queue_ms: u64,
    /// Silence prepended when playback arms (ms).
    pub start_lead_ms: u64,
    /// Extra silence prepended on re-arm after a previous play (ms).
    pub sentence_pause_ms: u64,
    /// Quiet window after a supersede before arming is allowed (ms).
    pub arm_supersede_quiet_ms: u64,
    /// Recent-playback window inside which a supersede goes soft (ms).
    pub commit_guard_ms: u64,
    /// Whether prefix-change supersedes are honored at all.
    pub supersede_prefix_enabled: bool,
    /// Hard cap on buffered audio (ms); oldest dropped beyond it.
    pub max_buffer_ms: u64,
    /// Overflow within this window of first playback is accepted (ms).
    pub trim_grace_ms: u64,
    /// Queue depth below which `queue_low` fires while armed (ms).
    pub queue_low_threshold_ms: u64,
    /// Edge fade applied to each pushed chunk (ms).
    pub edge_fade_ms: u64,
    /// Window searched for a zero crossing at a chunk head (ms).
    pub zero_cross_search_ms: u64,
    /// Crossfade length bounds at segment joins (ms).
    pub crossfade_min_ms: u64,
    pub crossfade_max_ms: u64,
    /// RMS comparison window at joins (ms).
    pub rms_window_ms: u64,
    /// RMS delta below which chunks are appended without crossfade.
    pub rms_delta_floor: f32,
    /// RMS delta that saturates the crossfade length ramp.
    pub rms_delta_span: f32,
    /// Linear ramp applied to the first audible samples (ms).
    pub fade_in_ms: u64,
    /// Cadence of `diagnostic` events while rendering (ms).
    pub diagnostic_interval_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            input_rate: 24_000,
            initial_queue_ms: 1200,
            rearm_queue_ms: 80,
            start_lead_ms: 120,
            sentence_pause_ms: 120,
            arm_supersede_quiet_ms: 300,
            commit_guard_ms: 250,
            supersede_prefix_enabled: true,
            max_buffer_ms: 12_000,
            trim_grace_ms: 400,
            queue_low_threshold_ms: 220,
            edge_fade_ms: 8,
            zero_cross_search_ms: 6,
            crossfade_min_ms: 12,
            crossfade_max_ms: 20,
            rms_window_ms: 20,
            rms_delta_floor: 0.02,
            rms_delta_span: 0.12,
            fade_in_ms: 80,
            diagnostic_interval_ms: 250,
        }
    }
}

/// Caption processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptionConfig {
    /// Debounce before scheduling a voice for new pending text (ms).
    pub debounce_ms: u64,
    /// Idle window after the last caption update before a forced commit (ms).
    pub commit_timeout_ms: u64,
    /// Window after the last audio burst with no caption (ms).
    pub audio_fallback_ms: u64,
    /// Voice duration estimate per character (ms).
    pub char_ms: u64,
    /// Clamp on the voice duration estimate (ms).
    pub min_voice_ms: u64,
    pub max_voice_ms: u64,
    /// Commits before rate alerts are considered meaningful.
    pub alert_min_commits: u64,
    /// Alert thresholds, as rates over committed captions.
    pub short_fallback_alert: f64,
    pub audio_fallback_alert: f64,
    pub timeout_alert: f64,
    pub text_missing_alert: f64,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 600,
            commit_timeout_ms: 1300,
            audio_fallback_ms: 900,
            char_ms: 80,
            min_voice_ms: 400,
            max_voice_ms: 6000,
            alert_min_commits: 200,
            short_fallback_alert: 0.2,
            audio_fallback_alert: 0.2,
            timeout_alert: 0.2,
            text_missing_alert: 0.05,
        }
    }
}
