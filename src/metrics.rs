//! Atomic counters shared across a running proxy.
//!
//! One `Metrics` instance is created at startup and handed to every
//! component as an `Arc`. Counters are plain relaxed atomics; nothing here
//! is on a hot enough path to warrant anything cleverer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    pub segments_committed: AtomicU64,
    pub turns_committed: AtomicU64,
    pub empty_turns_suppressed: AtomicU64,
    pub silent_segments: AtomicU64,
    pub floor_merges: AtomicU64,
    pub segments_dropped_overflow: AtomicU64,
    pub pending_texts_dropped: AtomicU64,
    pub pending_audio_discarded: AtomicU64,
    pub text_length_mismatches: AtomicU64,
    pub forced_completions: AtomicU64,
    pub diagnostics_emitted: AtomicU64,
    pub audio_chunks_in: AtomicU64,
    pub audio_bytes_in: AtomicU64,
    pub rate_limited_drops: AtomicU64,
    pub reconnects: AtomicU64,
    pub resumed_connections: AtomicU64,
    pub send_failures: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub pending_frames_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// One-line summary for session-end logging.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "segmentsCommitted": self.segments_committed.load(Ordering::Relaxed),
            "turnsCommitted": self.turns_committed.load(Ordering::Relaxed),
            "emptyTurnsSuppressed": self.empty_turns_suppressed.load(Ordering::Relaxed),
            "silentSegments": self.silent_segments.load(Ordering::Relaxed),
            "floorMerges": self.floor_merges.load(Ordering::Relaxed),
            "segmentsDroppedOverflow": self.segments_dropped_overflow.load(Ordering::Relaxed),
            "pendingTextsDropped": self.pending_texts_dropped.load(Ordering::Relaxed),
            "pendingAudioDiscarded": self.pending_audio_discarded.load(Ordering::Relaxed),
            "textLengthMismatches": self.text_length_mismatches.load(Ordering::Relaxed),
            "forcedCompletions": self.forced_completions.load(Ordering::Relaxed),
            "audioChunksIn": self.audio_chunks_in.load(Ordering::Relaxed),
            "audioBytesIn": self.audio_bytes_in.load(Ordering::Relaxed),
            "rateLimitedDrops": self.rate_limited_drops.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "resumedConnections": self.resumed_connections.load(Ordering::Relaxed),
            "sendFailures": self.send_failures.load(Ordering::Relaxed),
            "framesForwarded": self.frames_forwarded.load(Ordering::Relaxed),
        })
    }
}

/// Relaxed increment, the only access pattern the proxy needs.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
