//! Typed events emitted toward the downstream client.
//!
//! Everything here serializes to a JSON frame with an `event` tag; binary
//! PCM frames bypass this module entirely.

use serde::Serialize;

/// Events produced by the segmentation engine, in emission order.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event")]
pub enum SegEvent {
    #[serde(rename = "SEGMENT_COMMIT", rename_all = "camelCase")]
    SegmentCommit {
        segment_id: String,
        turn_id: u64,
        index: u32,
        text: String,
        /// Base64-encoded PCM16 LE at the segmenter sample rate.
        audio: String,
        duration_ms: u64,
        nominal_duration_ms: u64,
        audio_bytes: usize,
        audio_samples: usize,
    },
    #[serde(rename = "TURN_COMMIT", rename_all = "camelCase")]
    TurnCommit {
        turn_id: u64,
        final_text: String,
        segment_count: u32,
    },
    #[serde(rename = "SEGMENT_DIAGNOSTICS")]
    Diagnostics(SegmentDiagnostics),
}

/// Snapshot emitted only when a turn looks suspicious (zero-audio segments,
/// a short best candidate, or transcript with no audio at all).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDiagnostics {
    pub session_id: String,
    pub turn_id: u64,
    pub transcript_length: usize,
    pub partial_length: usize,
    pub pending_text_count: usize,
    pub pending_text_length: usize,
    pub pending_audio_bytes: usize,
    pub audio_chunk_count: u64,
    pub audio_chunk_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_chunk_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_chunk_max: Option<u64>,
    pub zero_audio_segments: u64,
}

/// Terminal close notification forwarded before the downstream socket shuts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClosed {
    pub event: &'static str,
    pub code: u16,
    pub reason: String,
}

impl UpstreamClosed {
    pub fn new(code: u16, reason: String) -> Self {
        Self {
            event: "upstream_closed",
            code,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_commit_frame_shape() {
        let ev = SegEvent::SegmentCommit {
            segment_id: "1-0-a1b2c3d4e5f6".into(),
            turn_id: 1,
            index: 0,
            text: "こんにちは。".into(),
            audio: String::new(),
            duration_ms: 400,
            nominal_duration_ms: 400,
            audio_bytes: 19200,
            audio_samples: 9600,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "SEGMENT_COMMIT");
        assert_eq!(v["segmentId"], "1-0-a1b2c3d4e5f6");
        assert_eq!(v["turnId"], 1);
        assert_eq!(v["durationMs"], 400);
        assert_eq!(v["audioSamples"], 9600);
    }

    #[test]
    fn test_turn_commit_frame_shape() {
        let ev = SegEvent::TurnCommit {
            turn_id: 3,
            final_text: "done.".into(),
            segment_count: 2,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "TURN_COMMIT");
        assert_eq!(v["finalText"], "done.");
        assert_eq!(v["segmentCount"], 2);
    }

    #[test]
    fn test_diagnostics_omits_empty_min_max() {
        let diag = SegmentDiagnostics {
            session_id: "abc".into(),
            turn_id: 1,
            transcript_length: 5,
            partial_length: 0,
            pending_text_count: 0,
            pending_text_length: 0,
            pending_audio_bytes: 0,
            audio_chunk_count: 0,
            audio_chunk_bytes: 0,
            audio_chunk_min: None,
            audio_chunk_max: None,
            zero_audio_segments: 1,
        };
        let v = serde_json::to_value(SegEvent::Diagnostics(diag)).unwrap();
        assert_eq!(v["event"], "SEGMENT_DIAGNOSTICS");
        assert!(v.get("audioChunkMin").is_none());
        assert_eq!(v["zeroAudioSegments"], 1);
    }

    #[test]
    fn test_upstream_closed_frame() {
        let v = serde_json::to_value(UpstreamClosed::new(1011, "server fault".into())).unwrap();
        assert_eq!(v["event"], "upstream_closed");
        assert_eq!(v["code"], 1011);
    }
}
