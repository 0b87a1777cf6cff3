//! Segmentation engine: pairs transcript sentences with silence-delimited
//! PCM segments and emits ordered commit events.
//!
//! The engine is synchronous and time-injected. Callers feed payloads and
//! decoded audio chunks through [`Segmenter::ingest`], sleep on
//! [`Segmenter::finalize_deadline`], and fire [`Segmenter::on_finalize_timer`]
//! when it elapses. All outputs come back as [`SegEvent`] lists; the
//! segmenter itself never performs I/O and never errors; malformed input
//! is ignored.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::audio_extract::AudioChunk;
use crate::config::SegmenterConfig;
use crate::events::{SegEvent, SegmentDiagnostics};
use crate::metrics::{self, Metrics};
use crate::transcript;
use crate::util;

/// Pending turn-finalization window.
#[derive(Debug)]
struct FinalizeTimer {
    started_at: Instant,
    deadline: Instant,
    /// The single permitted extension has been used.
    extended: bool,
    /// Transcript length when the timer was armed, for growth detection.
    transcript_chars_at_arm: usize,
}

#[derive(Debug)]
pub struct Segmenter {
    cfg: SegmenterConfig,
    metrics: Arc<Metrics>,
    session_id: String,

    turn_id: u64,
    committed_count: u32,
    segment_seq: u64,

    current_transcript: String,
    current_partial: String,
    /// Complete sentences enqueued so far for this turn.
    enqueued_complete: usize,
    /// Characters of the partial already committed by a forced enqueue.
    partial_committed_chars: usize,
    partial_last_updated_at: Option<Instant>,
    /// Chars of the best candidate seen last, for diagnostics.
    last_candidate_chars: Option<usize>,

    pending_texts: VecDeque<String>,
    /// Unsegmented PCM tail, in arrival order.
    pending_audio: Vec<Vec<u8>>,
    /// Silence-split buffers awaiting pairing.
    segmented_audio: VecDeque<Vec<u8>>,
    silence_run: usize,

    finalize: Option<FinalizeTimer>,
    any_segment_this_turn: bool,
    emitted_text_chars: usize,

    // Per-turn chunk stats for diagnostics.
    chunk_count: u64,
    chunk_bytes: u64,
    chunk_min: Option<u64>,
    chunk_max: Option<u64>,
    zero_audio_segments: u64,
    diag_signatures: HashSet<String>,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig, metrics: Arc<Metrics>, session_id: String) -> Self {
        Self {
            cfg,
            metrics,
            session_id,
            turn_id: 1,
            committed_count: 0,
            segment_seq: 0,
            current_transcript: String::new(),
            current_partial: String::new(),
            enqueued_complete: 0,
            partial_committed_chars: 0,
            partial_last_updated_at: None,
            last_candidate_chars: None,
            pending_texts: VecDeque::new(),
            pending_audio: Vec::new(),
            segmented_audio: VecDeque::new(),
            silence_run: 0,
            finalize: None,
            any_segment_this_turn: false,
            emitted_text_chars: 0,
            chunk_count: 0,
            chunk_bytes: 0,
            chunk_min: None,
            chunk_max: None,
            zero_audio_segments: 0,
            diag_signatures: HashSet::new(),
        }
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// When the trailing partial last grew, if it has.
    pub fn partial_last_updated_at(&self) -> Option<Instant> {
        self.partial_last_updated_at
    }

    /// Ingest an upstream payload and/or decoded audio chunks.
    pub fn ingest(
        &mut self,
        payload: Option<&Value>,
        chunks: &[AudioChunk],
        now: Instant,
    ) -> Vec<SegEvent> {
        let mut events = Vec::new();

        if let Some(payload) = payload {
            self.ingest_transcript(payload, now);
        }
        for chunk in chunks {
            self.ingest_chunk(chunk);
        }

        let before = events.len();
        self.drain(false, &mut events);
        let emitted = events.len() > before;

        if payload.map(transcript::is_generation_complete).unwrap_or(false) {
            self.arm_finalize(now);
        }
        self.maybe_extend_finalize(emitted);
        self.maybe_diagnostics(&mut events);
        events
    }

    /// Deadline of the pending finalization window, if armed.
    pub fn finalize_deadline(&self) -> Option<Instant> {
        self.finalize.as_ref().map(|t| t.deadline)
    }

    /// Fire the finalization timer if its deadline has passed.
    pub fn on_finalize_timer(&mut self, now: Instant) -> Vec<SegEvent> {
        let due = self
            .finalize
            .as_ref()
            .map(|timer| now >= timer.deadline)
            .unwrap_or(false);
        if due {
            self.finish_turn()
        } else {
            Vec::new()
        }
    }

    /// Forced completion on connection close: finalize immediately.
    pub fn force_complete(&mut self) -> Vec<SegEvent> {
        metrics::incr(&self.metrics.forced_completions);
        self.finish_turn()
    }

    // ── transcript side ────────────────────────────────────────────────

    fn ingest_transcript(&mut self, payload: &Value, now: Instant) {
        let Some(text) = transcript::extract_transcript(payload) else {
            return;
        };
        self.last_candidate_chars = Some(text.trim().chars().count());
        self.current_transcript = text;

        let (complete, partial) = transcript::split_sentences(&self.current_transcript);
        if complete.len() < self.enqueued_complete {
            // Revision: the transcript shrank under us.
            let dropped = self.pending_texts.len();
            if dropped > 0 {
                metrics::add(&self.metrics.pending_texts_dropped, dropped as u64);
            }
            warn!(
                turn = self.turn_id,
                dropped,
                was = self.enqueued_complete,
                now = complete.len(),
                "transcript shrank, dropping unemitted pending texts"
            );
            self.pending_texts.clear();
            self.enqueued_complete = complete.len();
            self.partial_committed_chars = 0;
        } else if complete.len() > self.enqueued_complete {
            for sentence in &complete[self.enqueued_complete..] {
                self.pending_texts.push_back(sentence.clone());
            }
            self.enqueued_complete = complete.len();
        }

        if partial != self.current_partial {
            if partial.chars().count() > self.current_partial.chars().count() {
                self.partial_last_updated_at = Some(now);
            }
            self.current_partial = partial;
        }
    }

    // ── audio side ─────────────────────────────────────────────────────

    fn ingest_chunk(&mut self, chunk: &AudioChunk) {
        if let Some(mime) = &chunk.mime {
            if !mime.starts_with("audio/pcm") {
                debug!(mime = %mime, "ignoring non-pcm chunk");
                return;
            }
            if let Some(rate) = mime_rate(mime) {
                if rate != self.cfg.sample_rate {
                    debug!(rate, expected = self.cfg.sample_rate, "chunk rate mismatch");
                }
            }
        }
        if chunk.bytes.len() < 2 {
            return;
        }
        metrics::incr(&self.metrics.audio_chunks_in);
        metrics::add(&self.metrics.audio_bytes_in, chunk.bytes.len() as u64);
        self.chunk_count += 1;
        self.chunk_bytes += chunk.bytes.len() as u64;
        let len = chunk.bytes.len() as u64;
        self.chunk_min = Some(self.chunk_min.map_or(len, |m| m.min(len)));
        self.chunk_max = Some(self.chunk_max.map_or(len, |m| m.max(len)));

        let samples = util::pcm16_to_i16(&chunk.bytes);
        let min_run = self.cfg.min_silence_samples().max(1);
        let mut start = 0usize;
        for (i, &s) in samples.iter().enumerate() {
            if (s as i32).abs() <= self.cfg.silence_threshold {
                self.silence_run += 1;
                if self.silence_run >= min_run {
                    let head = chunk.bytes[start * 2..(i + 1) * 2].to_vec();
                    if !head.is_empty() {
                        self.pending_audio.push(head);
                    }
                    self.commit_audio_segment();
                    self.silence_run = 0;
                    start = i + 1;
                }
            } else {
                self.silence_run = 0;
            }
        }
        if start < samples.len() {
            self.pending_audio
                .push(chunk.bytes[start * 2..samples.len() * 2].to_vec());
        }
    }

    /// Freeze the unsegmented tail into one pairing-ready buffer.
    fn commit_audio_segment(&mut self) {
        if self.pending_audio.is_empty() {
            return;
        }
        let total: usize = self.pending_audio.iter().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(total);
        for piece in self.pending_audio.drain(..) {
            buf.extend_from_slice(&piece);
        }
        self.segmented_audio.push_back(buf);
        if self.segmented_audio.len() > self.cfg.max_pending_segments {
            let dropped = self.segmented_audio.pop_front().map(|b| b.len()).unwrap_or(0);
            metrics::incr(&self.metrics.segments_dropped_overflow);
            warn!(
                turn = self.turn_id,
                bytes = dropped,
                cap = self.cfg.max_pending_segments,
                "segmented audio queue overflow, dropped oldest"
            );
        }
    }

    // ── pairing ────────────────────────────────────────────────────────

    fn drain(&mut self, allow_silent: bool, events: &mut Vec<SegEvent>) {
        while let Some(text) = self.pending_texts.front().cloned() {
            let mut audio = match self.segmented_audio.pop_front() {
                Some(buf) => buf,
                None if allow_silent => Vec::new(),
                None => break,
            };
            // Merge queued audio up to the duration floor.
            while util::duration_ms_for_bytes(audio.len(), self.cfg.sample_rate)
                < self.cfg.min_segment_ms
            {
                match self.segmented_audio.pop_front() {
                    Some(next) => {
                        audio.extend_from_slice(&next);
                        metrics::incr(&self.metrics.floor_merges);
                    }
                    None => break,
                }
            }
            self.pending_texts.pop_front();
            events.push(self.emit_segment(text, audio));
        }
    }

    fn emit_segment(&mut self, text: String, audio: Vec<u8>) -> SegEvent {
        let duration_ms = util::duration_ms_for_bytes(audio.len(), self.cfg.sample_rate);
        if audio.is_empty() {
            self.zero_audio_segments += 1;
            metrics::incr(&self.metrics.silent_segments);
        }
        let segment_id = format!("{}-{}-{}", self.turn_id, self.segment_seq, util::hex_id(6));
        debug!(
            %segment_id,
            index = self.committed_count,
            bytes = audio.len(),
            duration_ms,
            "segment commit"
        );
        let event = SegEvent::SegmentCommit {
            segment_id,
            turn_id: self.turn_id,
            index: self.committed_count,
            text: text.clone(),
            audio: BASE64.encode(&audio),
            duration_ms,
            nominal_duration_ms: duration_ms,
            audio_bytes: audio.len(),
            audio_samples: audio.len() / 2,
        };
        self.emitted_text_chars += text.chars().count();
        self.committed_count += 1;
        self.segment_seq += 1;
        self.any_segment_this_turn = true;
        metrics::incr(&self.metrics.segments_committed);
        event
    }

    // ── finalization ───────────────────────────────────────────────────

    fn arm_finalize(&mut self, now: Instant) {
        if self.finalize.is_some() {
            return;
        }
        self.finalize = Some(FinalizeTimer {
            started_at: now,
            deadline: now + Duration::from_millis(self.cfg.finalize_grace_ms),
            extended: false,
            transcript_chars_at_arm: self.current_transcript.chars().count(),
        });
    }

    /// One extension per window: late segments or transcript growth push the
    /// deadline out to `grace + extend` past the original start.
    fn maybe_extend_finalize(&mut self, emitted: bool) {
        let transcript_chars = self.current_transcript.chars().count();
        let extend_by = Duration::from_millis(self.cfg.finalize_grace_ms + self.cfg.finalize_extend_ms);
        if let Some(timer) = &mut self.finalize {
            if !timer.extended && (emitted || transcript_chars > timer.transcript_chars_at_arm) {
                timer.deadline = timer.started_at + extend_by;
                timer.extended = true;
            }
        }
    }

    fn finish_turn(&mut self) -> Vec<SegEvent> {
        let mut events = Vec::new();

        // Enqueue the trailing partial, freezing in-flight audio first.
        let partial = self.current_partial.trim().to_string();
        self.commit_audio_segment();
        if !partial.is_empty() && partial.chars().count() > self.partial_committed_chars {
            self.pending_texts.push_back(partial.clone());
            self.enqueued_complete += 1;
            self.partial_committed_chars = self.current_partial.chars().count();
        }

        self.drain(true, &mut events);

        let final_text = self.current_transcript.trim().to_string();
        let emit_turn =
            !final_text.is_empty() || self.committed_count > 0 || self.any_segment_this_turn;
        if emit_turn {
            if self.emitted_text_chars > self.current_transcript.chars().count() {
                metrics::incr(&self.metrics.text_length_mismatches);
                warn!(
                    turn = self.turn_id,
                    emitted = self.emitted_text_chars,
                    transcript = self.current_transcript.chars().count(),
                    "segment text length exceeds transcript"
                );
            }
            events.push(SegEvent::TurnCommit {
                turn_id: self.turn_id,
                final_text,
                segment_count: self.committed_count,
            });
            metrics::incr(&self.metrics.turns_committed);
        } else {
            metrics::incr(&self.metrics.empty_turns_suppressed);
        }

        self.maybe_diagnostics(&mut events);

        // Audio left in the queues has no text to pair with; account for it.
        let leftover: usize = self.segmented_audio.iter().map(Vec::len).sum::<usize>()
            + self.pending_audio.iter().map(Vec::len).sum::<usize>();
        if leftover > 0 {
            metrics::add(&self.metrics.pending_audio_discarded, leftover as u64);
            debug!(turn = self.turn_id, bytes = leftover, "unpaired audio at turn end");
        }

        self.reset_turn();
        events
    }

    fn reset_turn(&mut self) {
        self.turn_id += 1;
        self.committed_count = 0;
        self.segment_seq = 0;
        self.current_transcript.clear();
        self.current_partial.clear();
        self.enqueued_complete = 0;
        self.partial_committed_chars = 0;
        self.partial_last_updated_at = None;
        self.last_candidate_chars = None;
        self.pending_texts.clear();
        self.pending_audio.clear();
        self.segmented_audio.clear();
        self.silence_run = 0;
        self.finalize = None;
        self.any_segment_this_turn = false;
        self.emitted_text_chars = 0;
        self.chunk_count = 0;
        self.chunk_bytes = 0;
        self.chunk_min = None;
        self.chunk_max = None;
        self.zero_audio_segments = 0;
    }

    // ── diagnostics ────────────────────────────────────────────────────

    fn maybe_diagnostics(&mut self, events: &mut Vec<SegEvent>) {
        let short_candidate = self.last_candidate_chars.map(|n| n <= 4).unwrap_or(false);
        let text_without_audio = !self.current_transcript.is_empty() && self.chunk_bytes == 0;
        let suspicious = self.zero_audio_segments > 0 || short_candidate || text_without_audio;
        if !suspicious {
            return;
        }
        let signature = format!(
            "t{}:z{}:s{}:n{}",
            self.turn_id, self.zero_audio_segments, short_candidate as u8, text_without_audio as u8
        );
        if !self.diag_signatures.insert(signature) {
            return;
        }
        metrics::incr(&self.metrics.diagnostics_emitted);
        events.push(SegEvent::Diagnostics(SegmentDiagnostics {
            session_id: self.session_id.clone(),
            turn_id: self.turn_id,
            transcript_length: self.current_transcript.chars().count(),
            partial_length: self.current_partial.chars().count(),
            pending_text_count: self.pending_texts.len(),
            pending_text_length: self.pending_texts.iter().map(|t| t.chars().count()).sum(),
            pending_audio_bytes: self.pending_audio.iter().map(Vec::len).sum(),
            audio_chunk_count: self.chunk_count,
            audio_chunk_bytes: self.chunk_bytes,
            audio_chunk_min: self.chunk_min,
            audio_chunk_max: self.chunk_max,
            zero_audio_segments: self.zero_audio_segments,
        }));
    }
}

fn mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .find_map(|part| part.trim().strip_prefix("rate="))
        .and_then(|r| r.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segmenter(cfg: SegmenterConfig) -> Segmenter {
        Segmenter::new(cfg, Metrics::new(), "test00sess00".to_string())
    }

    fn pcm_chunk(loud: usize, quiet: usize) -> AudioChunk {
        let mut samples: Vec<i16> = vec![5000; loud];
        samples.extend(std::iter::repeat(0).take(quiet));
        AudioChunk {
            bytes: util::i16_slice_to_u8(&samples).to_vec(),
            mime: Some("audio/pcm;rate=24000".to_string()),
        }
    }

    fn commits(events: &[SegEvent]) -> Vec<&SegEvent> {
        events
            .iter()
            .filter(|e| matches!(e, SegEvent::SegmentCommit { .. }))
            .collect()
    }

    #[test]
    fn test_single_aligned_sentence_then_complete() {
        // Scenario: one sentence, one silence-cut segment, then completion.
        let cfg = SegmenterConfig {
            silence_threshold: 600,
            silence_duration_ms: 300,
            ..Default::default()
        };
        let mut seg = segmenter(cfg);
        let t0 = Instant::now();

        let payload = json!({ "serverContent": { "outputTranscription": { "text": "こんにちは。" } } });
        let events = seg.ingest(Some(&payload), &[pcm_chunk(2400, 7200)], t0);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SegEvent::SegmentCommit {
                turn_id,
                index,
                text,
                audio_bytes,
                duration_ms,
                audio_samples,
                ..
            } => {
                assert_eq!(*turn_id, 1);
                assert_eq!(*index, 0);
                assert_eq!(text, "こんにちは。");
                assert_eq!(*audio_bytes, 19200);
                assert_eq!(*duration_ms, 400);
                assert_eq!(*audio_samples, 9600);
            }
            other => panic!("expected SegmentCommit, got {:?}", other),
        }

        let done = json!({
            "generationComplete": true,
            "serverContent": { "outputTranscription": { "text": "こんにちは。" } }
        });
        assert!(seg.ingest(Some(&done), &[], t0).is_empty());
        assert!(seg.finalize_deadline().is_some());

        let fire_at = seg.finalize_deadline().unwrap();
        let events = seg.on_finalize_timer(fire_at);
        assert_eq!(
            events,
            vec![SegEvent::TurnCommit {
                turn_id: 1,
                final_text: "こんにちは。".to_string(),
                segment_count: 1,
            }]
        );
        assert_eq!(seg.turn_id(), 2);
    }

    #[test]
    fn test_empty_turn_suppressed() {
        let mut seg = segmenter(SegmenterConfig::default());
        let t0 = Instant::now();
        assert!(seg.ingest(Some(&json!({ "generationComplete": true })), &[], t0).is_empty());
        assert!(seg.force_complete().is_empty());
        // The turn still advances even when suppressed.
        assert_eq!(seg.turn_id(), 2);
    }

    #[test]
    fn test_partial_forced_on_close() {
        let mut seg = segmenter(SegmenterConfig::default());
        let t0 = Instant::now();
        let payload = json!({ "serverContent": { "outputTranscription": { "text": "テ" } } });
        let events = seg.ingest(Some(&payload), &[pcm_chunk(2400, 0)], t0);
        // The one-char candidate trips a diagnostics frame but no commit.
        assert!(commits(&events).is_empty());

        let events = seg.force_complete();
        assert_eq!(events.len(), 2);
        match &events[0] {
            SegEvent::SegmentCommit {
                turn_id,
                index,
                text,
                audio_bytes,
                ..
            } => {
                assert_eq!(*turn_id, 1);
                assert_eq!(*index, 0);
                assert_eq!(text, "テ");
                assert_eq!(*audio_bytes, 4800);
            }
            other => panic!("expected SegmentCommit, got {:?}", other),
        }
        assert_eq!(
            events[1],
            SegEvent::TurnCommit {
                turn_id: 1,
                final_text: "テ".to_string(),
                segment_count: 1,
            }
        );
    }

    #[test]
    fn test_transcript_shrink_drops_unpaired() {
        let cfg = SegmenterConfig {
            silence_duration_ms: 300,
            ..Default::default()
        };
        let mut seg = segmenter(cfg);
        let t0 = Instant::now();

        let payload = json!({ "serverContent": { "outputTranscription": { "text": "ABC。DEF。" } } });
        let events = seg.ingest(Some(&payload), &[pcm_chunk(2400, 7200)], t0);
        assert_eq!(commits(&events).len(), 1);

        let shrunk = json!({ "serverContent": { "outputTranscription": { "text": "ABC。" } } });
        assert!(commits(&seg.ingest(Some(&shrunk), &[], t0)).is_empty());

        let events = seg.force_complete();
        // Only the turn commit; DEF。 was dropped by the shrink.
        assert_eq!(commits(&events).len(), 0);
        match events.last().unwrap() {
            SegEvent::TurnCommit {
                final_text,
                segment_count,
                ..
            } => {
                assert_eq!(final_text, "ABC。");
                assert_eq!(*segment_count, 1);
            }
            other => panic!("expected TurnCommit, got {:?}", other),
        }
    }

    #[test]
    fn test_idempotent_reingest() {
        let mut seg = segmenter(SegmenterConfig::default());
        let t0 = Instant::now();
        let payload = json!({ "serverContent": { "outputTranscription": { "text": "Hello there." } } });
        assert!(commits(&seg.ingest(Some(&payload), &[], t0)).is_empty());
        for _ in 0..5 {
            // Re-feeding an unchanged transcript never re-enqueues sentences.
            assert!(seg.ingest(Some(&payload), &[], t0).is_empty());
        }
        let events = seg.force_complete();
        // Exactly one segment despite six identical ingests.
        assert_eq!(commits(&events).len(), 1);
    }

    #[test]
    fn test_duration_floor_merges_queued_audio() {
        // Two short cuts, one sentence: the floor pulls the second buffer in.
        let cfg = SegmenterConfig {
            silence_duration_ms: 50, // 1200 samples
            ..Default::default()
        };
        let mut seg = segmenter(cfg);
        let t0 = Instant::now();

        // Each burst: 1200 loud + 1200 silent = 100 ms per cut buffer.
        let events = seg.ingest(None, &[pcm_chunk(1200, 1200), pcm_chunk(1200, 1200)], t0);
        assert!(events.is_empty());

        let payload = json!({ "serverContent": { "outputTranscription": { "text": "短い。" } } });
        let events = seg.ingest(Some(&payload), &[], t0);
        let committed = commits(&events);
        assert_eq!(committed.len(), 1);
        match committed[0] {
            SegEvent::SegmentCommit { audio_bytes, duration_ms, .. } => {
                // Both 100 ms buffers merged; still under the 300 ms floor
                // but the queue is exhausted.
                assert_eq!(*audio_bytes, 9600);
                assert_eq!(*duration_ms, 200);
            }
            other => panic!("expected SegmentCommit, got {:?}", other),
        }
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let cfg = SegmenterConfig {
            silence_duration_ms: 50,
            max_pending_segments: 2,
            ..Default::default()
        };
        let metrics = Metrics::new();
        let mut seg = Segmenter::new(cfg, metrics.clone(), "s".into());
        let t0 = Instant::now();

        for _ in 0..4 {
            seg.ingest(None, &[pcm_chunk(1200, 1200)], t0);
        }
        assert_eq!(
            metrics
                .segments_dropped_overflow
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn test_index_contiguous_and_turn_monotone() {
        let cfg = SegmenterConfig {
            silence_duration_ms: 50,
            min_segment_ms: 0,
            ..Default::default()
        };
        let mut seg = segmenter(cfg);
        let t0 = Instant::now();

        let payload = json!({ "serverContent": { "outputTranscription": { "text": "One. Two. Three." } } });
        let events = seg.ingest(
            Some(&payload),
            &[
                pcm_chunk(1200, 1200),
                pcm_chunk(1200, 1200),
                pcm_chunk(1200, 1200),
            ],
            t0,
        );
        let indexes: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SegEvent::SegmentCommit { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        let first_turn = seg.turn_id();
        seg.force_complete();
        assert_eq!(seg.turn_id(), first_turn + 1);
        seg.ingest(
            Some(&json!({ "serverContent": { "outputTranscription": { "text": "Next." } } })),
            &[],
            t0,
        );
        let events = seg.force_complete();
        let turn_commit = events
            .iter()
            .find(|e| matches!(e, SegEvent::TurnCommit { .. }))
            .expect("turn commit");
        match turn_commit {
            SegEvent::TurnCommit { turn_id, .. } => assert_eq!(*turn_id, first_turn + 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_finalize_extends_once_on_growth() {
        let cfg = SegmenterConfig::default();
        let grace = cfg.finalize_grace_ms;
        let extend = cfg.finalize_extend_ms;
        let mut seg = segmenter(cfg);
        let t0 = Instant::now();

        let text = json!({ "serverContent": { "outputTranscription": { "text": "まだ" } } });
        seg.ingest(Some(&text), &[], t0);
        seg.ingest(Some(&json!({ "generationComplete": true })), &[], t0);
        let initial_deadline = seg.finalize_deadline().unwrap();
        assert_eq!(initial_deadline, t0 + Duration::from_millis(grace));

        // Growth extends exactly once, to grace + extend past the start.
        let grown = json!({ "serverContent": { "outputTranscription": { "text": "まだまだ" } } });
        seg.ingest(Some(&grown), &[], t0 + Duration::from_millis(500));
        let extended = seg.finalize_deadline().unwrap();
        assert_eq!(extended, t0 + Duration::from_millis(grace + extend));

        let more = json!({ "serverContent": { "outputTranscription": { "text": "まだまだまだ" } } });
        seg.ingest(Some(&more), &[], t0 + Duration::from_millis(900));
        assert_eq!(seg.finalize_deadline().unwrap(), extended);

        // Before the deadline nothing fires; at the deadline the turn ends.
        assert!(seg.on_finalize_timer(t0 + Duration::from_millis(grace)).is_empty());
        let events = seg.on_finalize_timer(extended);
        assert!(events
            .iter()
            .any(|e| matches!(e, SegEvent::TurnCommit { .. })));
    }

    #[test]
    fn test_zero_audio_diagnostics_deduped() {
        let mut seg = segmenter(SegmenterConfig::default());
        let t0 = Instant::now();
        let payload = json!({ "serverContent": { "outputTranscription": { "text": "音なし。" } } });
        seg.ingest(Some(&payload), &[], t0);
        let events = seg.force_complete();
        let diags: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SegEvent::Diagnostics(_)))
            .collect();
        assert_eq!(diags.len(), 1);
        match diags[0] {
            SegEvent::Diagnostics(d) => {
                assert_eq!(d.turn_id, 1);
                assert_eq!(d.zero_audio_segments, 1);
                assert_eq!(d.audio_chunk_bytes, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mime_rate_parse() {
        assert_eq!(mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(mime_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(mime_rate("audio/pcm"), None);
    }
}
