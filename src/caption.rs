//! Caption processor: guards incoming caption text, debounces voice
//! scheduling, and force-commits captions that stall.
//!
//! Each caption key (`turn-N#seq`) gets its own pending state. New text
//! restarts a debounce window; when it fires, a "voice" is scheduled for
//! the uncommitted suffix with a per-character duration estimate. Captions
//! that stop updating are committed by fallback timers so a lost upstream
//! frame can never strand a caption forever.

use regex::Regex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CaptionConfig;

/// Single-character captions that are meaningful on their own.
const SHORT_TEXT_WHITELIST: &[&str] = &["はい", "うん", "ええ", "いいえ", "そう", "ok", "OK", "no", "yes"];

/// Why a caption was rejected by the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardReject {
    Empty,
    QuestionOnly,
    Blocked,
}

/// Why a caption was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    Timeout,
    AudioFallback,
    GenerationComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptionEvent {
    VoiceScheduled {
        key: String,
        voice_id: u64,
        text: String,
        estimated_ms: u64,
    },
    CaptionCommitted {
        key: String,
        text: String,
        reason: CommitReason,
    },
    MetricsAlert {
        metric: &'static str,
        rate: f64,
    },
}

/// Allow/block regex guard over raw caption strings.
#[derive(Debug)]
pub struct CaptionGuard {
    allow: Vec<Regex>,
    block: Vec<Regex>,
}

impl Default for CaptionGuard {
    fn default() -> Self {
        let allow = [
            r"^(はい|うん|ええ|いいえ|そうです(ね|か)?)$",
            r"^(ok|OK|yes|no)[.!]?$",
        ];
        let block = [
            // Pure punctuation or symbol noise.
            r"^[\s\p{P}\p{S}]+$",
            // Parenthetical stage directions.
            r"^[(\[（【].*[)\]）】]$",
        ];
        Self {
            allow: allow.iter().map(|p| Regex::new(p).unwrap()).collect(),
            block: block.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }
}

impl CaptionGuard {
    /// Sanitize a caption or explain why it was rejected.
    pub fn check(&self, raw: &str) -> Result<String, GuardReject> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(GuardReject::Empty);
        }
        if text == "?" || text == "？" {
            return Err(GuardReject::QuestionOnly);
        }
        if self.allow.iter().any(|re| re.is_match(text)) {
            return Ok(text.to_string());
        }
        if self.block.iter().any(|re| re.is_match(text)) {
            return Err(GuardReject::Blocked);
        }
        Ok(text.to_string())
    }
}

#[derive(Debug)]
struct Voice {
    id: u64,
    chars: usize,
    ends_at: Instant,
}

#[derive(Debug)]
struct CaptionEntry {
    pending_text: String,
    best_text: String,
    scheduled_chars: usize,
    committed_chars: usize,
    debounce_deadline: Option<Instant>,
    last_update_at: Instant,
    last_audio_at: Option<Instant>,
    voices: Vec<Voice>,
    committed: bool,
}

impl CaptionEntry {
    fn new(now: Instant) -> Self {
        Self {
            pending_text: String::new(),
            best_text: String::new(),
            scheduled_chars: 0,
            committed_chars: 0,
            debounce_deadline: None,
            last_update_at: now,
            last_audio_at: None,
            voices: Vec::new(),
            committed: false,
        }
    }
}

#[derive(Debug, Default)]
struct CaptionStats {
    commits: u64,
    short_fallbacks: u64,
    audio_fallbacks: u64,
    timeouts: u64,
    text_missing: u64,
    alerted: HashMap<&'static str, bool>,
}

#[derive(Debug)]
pub struct CaptionProcessor {
    cfg: CaptionConfig,
    guard: CaptionGuard,
    entries: HashMap<String, CaptionEntry>,
    next_voice_id: u64,
    stats: CaptionStats,
}

impl CaptionProcessor {
    pub fn new(cfg: CaptionConfig) -> Self {
        Self {
            cfg,
            guard: CaptionGuard::default(),
            entries: HashMap::new(),
            next_voice_id: 1,
            stats: CaptionStats::default(),
        }
    }

    pub fn guard(&self) -> &CaptionGuard {
        &self.guard
    }

    /// Feed a caption update for a key. Guarded text lands in the pending
    /// buffer and restarts the debounce window.
    pub fn on_caption(&mut self, key: &str, raw: &str, now: Instant) -> Vec<CaptionEvent> {
        let text = match self.guard.check(raw) {
            Ok(text) => text,
            Err(reason) => {
                debug!(key, ?reason, "caption rejected");
                return Vec::new();
            }
        };
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CaptionEntry::new(now));
        if entry.committed {
            return Vec::new();
        }
        entry.pending_text = text;
        if entry.pending_text.trim().chars().count() > entry.best_text.trim().chars().count() {
            entry.best_text = entry.pending_text.clone();
        }
        entry.last_update_at = now;
        entry.debounce_deadline = Some(now + Duration::from_millis(self.cfg.debounce_ms));
        Vec::new()
    }

    /// Note an audio burst for a key, arming the audio-fallback timer.
    pub fn on_audio(&mut self, key: &str, now: Instant) {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CaptionEntry::new(now));
        entry.last_audio_at = Some(now);
    }

    /// Explicit completion: commit the best candidate immediately.
    pub fn on_generation_complete(&mut self, key: &str, now: Instant) -> Vec<CaptionEvent> {
        let mut events = Vec::new();
        if let Some(mut entry) = self.entries.remove(key) {
            self.commit(key, &mut entry, CommitReason::GenerationComplete, now, &mut events);
        }
        events
    }

    /// Earliest pending deadline across all keys.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |candidate: Instant| {
            deadline = Some(match deadline {
                Some(d) => d.min(candidate),
                None => candidate,
            });
        };
        for entry in self.entries.values() {
            if let Some(d) = entry.debounce_deadline {
                consider(d);
            }
            for voice in &entry.voices {
                consider(voice.ends_at);
            }
            if !entry.committed && !entry.pending_text.is_empty() {
                consider(entry.last_update_at + Duration::from_millis(self.cfg.commit_timeout_ms));
            }
            if !entry.committed && entry.pending_text.is_empty() {
                if let Some(t) = entry.last_audio_at {
                    consider(t + Duration::from_millis(self.cfg.audio_fallback_ms));
                }
            }
        }
        deadline
    }

    /// Run all due timers: debounce voice scheduling, voice completion,
    /// and fallback commits.
    pub fn on_timer(&mut self, now: Instant) -> Vec<CaptionEvent> {
        let mut events = Vec::new();
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            let debounce_due;
            {
                let entry = self.entries.get(&key).unwrap();
                debounce_due = entry
                    .debounce_deadline
                    .map(|d| now >= d)
                    .unwrap_or(false);
            }

            if debounce_due {
                let voice_id = self.next_voice_id;
                let entry = self.entries.get_mut(&key).unwrap();
                entry.debounce_deadline = None;
                let total = entry.pending_text.chars().count();
                let unscheduled = total.saturating_sub(entry.scheduled_chars);
                if unscheduled > 0 {
                    let suffix: String = entry
                        .pending_text
                        .chars()
                        .skip(entry.scheduled_chars)
                        .collect();
                    let estimated_ms = (unscheduled as u64 * self.cfg.char_ms)
                        .clamp(self.cfg.min_voice_ms, self.cfg.max_voice_ms);
                    entry.voices.push(Voice {
                        id: voice_id,
                        chars: unscheduled,
                        ends_at: now + Duration::from_millis(estimated_ms),
                    });
                    entry.scheduled_chars = total;
                    self.next_voice_id += 1;
                    events.push(CaptionEvent::VoiceScheduled {
                        key: key.clone(),
                        voice_id,
                        text: suffix,
                        estimated_ms,
                    });
                }
            }

            let entry = self.entries.get_mut(&key).unwrap();
            // Voices whose estimate elapsed count as spoken.
            let mut done_chars = 0;
            entry.voices.retain(|voice| {
                if now >= voice.ends_at {
                    done_chars += voice.chars;
                    false
                } else {
                    true
                }
            });
            entry.committed_chars += done_chars;

            let idle_due = !entry.committed
                && !entry.pending_text.is_empty()
                && now >= entry.last_update_at + Duration::from_millis(self.cfg.commit_timeout_ms);
            let audio_due = !entry.committed
                && entry.pending_text.is_empty()
                && entry
                    .last_audio_at
                    .map(|t| now >= t + Duration::from_millis(self.cfg.audio_fallback_ms))
                    .unwrap_or(false);

            if idle_due || audio_due {
                let reason = if idle_due {
                    CommitReason::Timeout
                } else {
                    CommitReason::AudioFallback
                };
                let mut entry = self.entries.remove(&key).unwrap();
                self.commit(&key, &mut entry, reason, now, &mut events);
            }
        }
        self.check_alerts(&mut events);
        events
    }

    fn commit(
        &mut self,
        key: &str,
        entry: &mut CaptionEntry,
        reason: CommitReason,
        _now: Instant,
        events: &mut Vec<CaptionEvent>,
    ) {
        entry.committed = true;
        self.stats.commits += 1;
        match reason {
            CommitReason::Timeout => self.stats.timeouts += 1,
            CommitReason::AudioFallback => self.stats.audio_fallbacks += 1,
            CommitReason::GenerationComplete => {}
        }

        let candidate = if entry.best_text.trim().chars().count()
            >= entry.pending_text.trim().chars().count()
        {
            entry.best_text.trim().to_string()
        } else {
            entry.pending_text.trim().to_string()
        };

        match select_final(&candidate) {
            Some(text) => {
                events.push(CaptionEvent::CaptionCommitted {
                    key: key.to_string(),
                    text,
                    reason,
                });
            }
            None if candidate.is_empty() => {
                self.stats.text_missing += 1;
                debug!(key, ?reason, "caption committed with no text");
            }
            None => {
                self.stats.short_fallbacks += 1;
                debug!(key, ?reason, candidate = %candidate, "caption text too short, suppressed");
            }
        }
    }

    fn check_alerts(&mut self, events: &mut Vec<CaptionEvent>) {
        if self.stats.commits < self.cfg.alert_min_commits {
            return;
        }
        let commits = self.stats.commits as f64;
        let checks: [(&'static str, u64, f64); 4] = [
            ("short_fallback_rate", self.stats.short_fallbacks, self.cfg.short_fallback_alert),
            ("audio_fallback_rate", self.stats.audio_fallbacks, self.cfg.audio_fallback_alert),
            ("timeout_rate", self.stats.timeouts, self.cfg.timeout_alert),
            ("text_missing_rate", self.stats.text_missing, self.cfg.text_missing_alert),
        ];
        for (metric, count, threshold) in checks {
            let rate = count as f64 / commits;
            if rate > threshold && !self.stats.alerted.get(metric).copied().unwrap_or(false) {
                self.stats.alerted.insert(metric, true);
                warn!(metric, rate, threshold, "caption metric above threshold");
                events.push(CaptionEvent::MetricsAlert { metric, rate });
            }
        }
    }
}

/// Final sentence selection: multi-char text passes, single characters only
/// via the whitelist.
fn select_final(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() >= 2 {
        return Some(trimmed.to_string());
    }
    if SHORT_TEXT_WHITELIST.contains(&trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CaptionConfig {
        CaptionConfig::default()
    }

    #[test]
    fn test_guard_chain() {
        let guard = CaptionGuard::default();
        assert_eq!(guard.check("  こんにちは  "), Ok("こんにちは".to_string()));
        assert_eq!(guard.check(""), Err(GuardReject::Empty));
        assert_eq!(guard.check("   "), Err(GuardReject::Empty));
        assert_eq!(guard.check("?"), Err(GuardReject::QuestionOnly));
        assert_eq!(guard.check("？"), Err(GuardReject::QuestionOnly));
        // Allow-list wins over the punctuation block for interjections.
        assert_eq!(guard.check("はい"), Ok("はい".to_string()));
        assert_eq!(guard.check("!!!"), Err(GuardReject::Blocked));
        assert_eq!(guard.check("（笑）"), Err(GuardReject::Blocked));
    }

    #[test]
    fn test_debounce_schedules_voice_for_suffix() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        assert!(cp.on_caption("turn-1#0", "こんにち", t0).is_empty());

        // Not due before the debounce window.
        assert!(cp.on_timer(t0 + Duration::from_millis(100)).is_empty());

        let events = cp.on_timer(t0 + Duration::from_millis(600));
        assert_eq!(events.len(), 1);
        match &events[0] {
            CaptionEvent::VoiceScheduled { text, estimated_ms, .. } => {
                assert_eq!(text, "こんにち");
                // 4 chars * 80 ms clamps up to the 400 ms floor.
                assert_eq!(*estimated_ms, 400);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_voice_estimate_clamped() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        let long: String = "あ".repeat(200);
        cp.on_caption("k", &long, t0);
        let events = cp.on_timer(t0 + Duration::from_millis(600));
        match &events[0] {
            CaptionEvent::VoiceScheduled { estimated_ms, .. } => {
                // 200 chars * 80 ms = 16 s, clamped to 6 s.
                assert_eq!(*estimated_ms, 6000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_update_schedules_only_new_chars() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        cp.on_caption("k", "こんにち", t0);
        cp.on_timer(t0 + Duration::from_millis(600));

        cp.on_caption("k", "こんにちは世界", t0 + Duration::from_millis(700));
        let events = cp.on_timer(t0 + Duration::from_millis(1300));
        let scheduled: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CaptionEvent::VoiceScheduled { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(scheduled, vec!["は世界".to_string()]);
    }

    #[test]
    fn test_idle_timeout_commits() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        cp.on_caption("k", "最後の文です。", t0);
        let events = cp.on_timer(t0 + Duration::from_millis(1300));
        assert!(events.iter().any(|e| matches!(
            e,
            CaptionEvent::CaptionCommitted { reason: CommitReason::Timeout, text, .. }
                if text == "最後の文です。"
        )));
        // Entry is gone afterwards.
        assert!(cp.on_timer(t0 + Duration::from_millis(5000)).is_empty());
    }

    #[test]
    fn test_audio_fallback_counts_missing_text() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        cp.on_audio("k", t0);
        let events = cp.on_timer(t0 + Duration::from_millis(900));
        // No caption ever arrived: no commit event, text-missing counted.
        assert!(events.is_empty());
        assert_eq!(cp.stats.text_missing, 1);
        assert_eq!(cp.stats.audio_fallbacks, 1);
    }

    #[test]
    fn test_generation_complete_commits_best() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        cp.on_caption("k", "長いほうの候補です。", t0);
        cp.on_caption("k", "短い。", t0 + Duration::from_millis(100));
        let events = cp.on_generation_complete("k", t0 + Duration::from_millis(200));
        assert_eq!(
            events,
            vec![CaptionEvent::CaptionCommitted {
                key: "k".to_string(),
                text: "長いほうの候補です。".to_string(),
                reason: CommitReason::GenerationComplete,
            }]
        );
    }

    #[test]
    fn test_short_non_whitelisted_suppressed() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        cp.on_caption("k", "あ", t0);
        let events = cp.on_generation_complete("k", t0);
        assert!(events.is_empty());
        assert_eq!(cp.stats.short_fallbacks, 1);
    }

    #[test]
    fn test_alert_fires_after_min_commits() {
        let mut config = cfg();
        config.alert_min_commits = 10;
        let mut cp = CaptionProcessor::new(config);
        let t0 = Instant::now();
        // Ten caption-less audio keys: 100% audio-fallback rate.
        for i in 0..10 {
            cp.on_audio(&format!("k{}", i), t0);
        }
        let events = cp.on_timer(t0 + Duration::from_millis(900));
        assert!(events.iter().any(|e| matches!(
            e,
            CaptionEvent::MetricsAlert { metric: "audio_fallback_rate", .. }
        )));
        // Alerts fire once.
        for i in 10..20 {
            cp.on_audio(&format!("k{}", i), t0 + Duration::from_millis(1000));
        }
        let events = cp.on_timer(t0 + Duration::from_millis(2000));
        assert!(!events.iter().any(|e| matches!(
            e,
            CaptionEvent::MetricsAlert { metric: "audio_fallback_rate", .. }
        )));
    }

    #[test]
    fn test_next_deadline_tracks_earliest() {
        let mut cp = CaptionProcessor::new(cfg());
        let t0 = Instant::now();
        assert!(cp.next_deadline().is_none());
        cp.on_caption("k", "テキストです", t0);
        let deadline = cp.next_deadline().unwrap();
        // Debounce (600 ms) precedes the idle timeout (1300 ms).
        assert_eq!(deadline, t0 + Duration::from_millis(600));
    }
}
