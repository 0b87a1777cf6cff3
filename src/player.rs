//! Playback ring: a pull-driven mono float renderer.
//!
//! The player accepts PCM16 pushes tagged with an epoch, conditions each
//! chunk (zero-crossing trim, edge fades, adaptive crossfade joins), and
//! renders at the device rate via linear interpolation. It arms only once
//! enough audio is queued, signals underruns, and drops superseded audio
//! by epoch comparison. The host drives it from its audio callback and
//! drains diagnostic events after each interaction.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::PlayerConfig;
use crate::join::JoinScheduler;
use crate::ring::PcmRing;
use crate::util;
use crate::window;

/// Push-only diagnostic events observable by the host.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    #[serde(rename_all = "camelCase")]
    ContextInfo { device_rate: u32, input_rate: u32 },
    #[serde(rename_all = "camelCase")]
    ChunkMetrics {
        bytes: usize,
        samples: usize,
        trimmed_samples: usize,
        queued_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    QueueLow { queued_ms: u64 },
    Underrun,
    #[serde(rename_all = "camelCase")]
    Diagnostic {
        queued_ms: u64,
        epoch: u64,
        total_dropped: u64,
    },
    #[serde(rename_all = "camelCase")]
    JoinMetrics { crossfade_ms: u64, rms_delta: f32 },
    #[serde(rename_all = "camelCase")]
    PauseInserted { ms: u64 },
    #[serde(rename_all = "camelCase")]
    ArmBlocked { quiet_remaining_ms: u64 },
    #[serde(rename_all = "camelCase")]
    BufferTrimmed { dropped_ms: u64, grace_accepted: bool },
    #[serde(rename_all = "camelCase")]
    PlaybackArmed { queued_ms: u64, lead_ms: u64 },
}

/// Commands accepted over the player's inbox.
#[derive(Debug)]
pub enum PlayerCommand {
    Push { pcm: Vec<u8>, epoch: u64 },
    Epoch { epoch: u64, context_time: Option<f64> },
    PrefixEpoch { epoch: u64 },
    SoftFlush,
    Flush,
    Configure(Box<PlayerConfig>),
}

/// Bounded SPSC port between the session side and the audio callback.
pub fn command_channel(
    capacity: usize,
) -> (
    std::sync::mpsc::SyncSender<PlayerCommand>,
    std::sync::mpsc::Receiver<PlayerCommand>,
) {
    std::sync::mpsc::sync_channel(capacity)
}

#[derive(Debug)]
pub struct Player {
    cfg: PlayerConfig,
    device_rate: u32,
    ring: PcmRing,
    join: JoinScheduler,

    current_epoch: u64,
    /// Output has been produced since the last supersede or flush.
    has_played: bool,
    armed: bool,
    has_armed_once: bool,
    /// Device-rate silence samples rendered before the queue.
    lead_silence: usize,

    resample_pos: f64,
    resample_prev: Option<f32>,

    fade_in_remaining: usize,
    fade_in_total: usize,

    last_supersede_at: Option<Instant>,
    first_play_at: Option<Instant>,
    last_diag_at: Option<Instant>,
    underrun_in_episode: bool,
    queue_low_signaled: bool,

    total_dropped: u64,
    trim_grace_accepts: u64,

    events: Vec<PlayerEvent>,
}

impl Player {
    pub fn new(cfg: PlayerConfig, device_rate: u32) -> Self {
        let capacity = util::samples_for_ms(cfg.max_buffer_ms, cfg.input_rate)
            + util::samples_for_ms(2000, cfg.input_rate);
        let join = JoinScheduler::new(&cfg);
        let mut player = Self {
            device_rate,
            ring: PcmRing::new(capacity.max(1)),
            join,
            current_epoch: 0,
            has_played: false,
            armed: false,
            has_armed_once: false,
            lead_silence: 0,
            resample_pos: 0.0,
            resample_prev: None,
            fade_in_remaining: 0,
            fade_in_total: 0,
            last_supersede_at: None,
            first_play_at: None,
            last_diag_at: None,
            underrun_in_episode: false,
            queue_low_signaled: false,
            total_dropped: 0,
            trim_grace_accepts: 0,
            events: Vec::new(),
            cfg,
        };
        player.events.push(PlayerEvent::ContextInfo {
            device_rate,
            input_rate: player.cfg.input_rate,
        });
        player
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Pushes and overflows accepted under the pre-playback grace.
    pub fn trim_grace_accepts(&self) -> u64 {
        self.trim_grace_accepts
    }

    /// Queued audio depth in input-rate milliseconds.
    pub fn queued_ms(&self) -> u64 {
        (self.ring.len() as u64 * 1000) / self.cfg.input_rate as u64
    }

    pub fn drain_events(&mut self) -> Vec<PlayerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn configure(&mut self, cfg: PlayerConfig) {
        self.join = JoinScheduler::new(&cfg);
        self.cfg = cfg;
    }

    /// Drain the command inbox; called at the top of the audio callback
    /// before rendering.
    pub fn apply_commands(
        &mut self,
        inbox: &std::sync::mpsc::Receiver<PlayerCommand>,
        now: Instant,
    ) {
        while let Ok(cmd) = inbox.try_recv() {
            match cmd {
                PlayerCommand::Push { pcm, epoch } => self.push(&pcm, epoch, now),
                PlayerCommand::Epoch { epoch, context_time } => {
                    self.set_epoch(epoch, context_time, now)
                }
                PlayerCommand::PrefixEpoch { epoch } => {
                    self.prefix_supersede(epoch, now);
                }
                PlayerCommand::SoftFlush => self.soft_flush(),
                PlayerCommand::Flush => self.flush(),
                PlayerCommand::Configure(cfg) => self.configure(*cfg),
            }
        }
    }

    // ── input path ─────────────────────────────────────────────────────

    /// Push a PCM16 LE chunk tagged with the epoch active when it was sent.
    pub fn push(&mut self, pcm: &[u8], msg_epoch: u64, now: Instant) {
        // Acceptance policy: stale-by-more-than-one is dropped, stale-by-one
        // rides the pre-playback grace, ahead is an implicit supersede.
        if msg_epoch > self.current_epoch {
            debug!(from = self.current_epoch, to = msg_epoch, "push advanced epoch");
            self.current_epoch = msg_epoch;
            // Queued samples belong to the old epoch and must not bleed
            // into the new one. The arm quiet window is not started: the
            // superseding audio is the chunk being pushed right now.
            self.discard_playback_state();
        } else if msg_epoch < self.current_epoch {
            if msg_epoch + 1 == self.current_epoch && !self.has_played {
                self.trim_grace_accepts += 1;
            } else {
                self.total_dropped += 1;
                return;
            }
        }

        let mut samples = util::pcm16_to_f32(pcm);
        if samples.is_empty() {
            return;
        }

        let zc_window = util::samples_for_ms(self.cfg.zero_cross_search_ms, self.cfg.input_rate);
        let trimmed = window::first_zero_crossing(&samples, zc_window).unwrap_or(0);
        if trimmed > 0 {
            samples.drain(..trimmed);
        }
        if samples.is_empty() {
            return;
        }

        let edge = util::samples_for_ms(self.cfg.edge_fade_ms, self.cfg.input_rate);
        window::apply_fade_in(&mut samples, edge);
        window::apply_fade_out(&mut samples, edge);

        let (ready, decision) = self.join.process(samples);
        if let Some(d) = decision {
            self.events.push(PlayerEvent::JoinMetrics {
                crossfade_ms: (d.crossfade_samples as u64 * 1000) / self.cfg.input_rate as u64,
                rms_delta: d.rms_delta,
            });
        }
        self.ring.push_slice(&ready);
        self.enforce_buffer_cap(now);

        self.events.push(PlayerEvent::ChunkMetrics {
            bytes: pcm.len(),
            samples: ready.len(),
            trimmed_samples: trimmed,
            queued_ms: self.queued_ms(),
        });

        self.try_arm(now);
    }

    fn enforce_buffer_cap(&mut self, now: Instant) {
        let max_samples = util::samples_for_ms(self.cfg.max_buffer_ms, self.cfg.input_rate);
        let excess = self.ring.len().saturating_sub(max_samples);
        if excess == 0 {
            return;
        }
        let grace = Duration::from_millis(self.cfg.trim_grace_ms);
        let in_grace = match self.first_play_at {
            Some(t) => now.duration_since(t) <= grace,
            None => true,
        };
        let dropped_ms = (excess as u64 * 1000) / self.cfg.input_rate as u64;
        if in_grace {
            self.trim_grace_accepts += 1;
            self.events.push(PlayerEvent::BufferTrimmed {
                dropped_ms: 0,
                grace_accepted: true,
            });
        } else {
            self.ring.drop_oldest(excess);
            self.events.push(PlayerEvent::BufferTrimmed {
                dropped_ms,
                grace_accepted: false,
            });
        }
    }

    fn try_arm(&mut self, now: Instant) {
        if self.armed {
            return;
        }
        let threshold_ms = if self.has_armed_once {
            self.cfg.initial_queue_ms.min(self.cfg.rearm_queue_ms)
        } else {
            self.cfg.initial_queue_ms
        };
        if self.queued_ms() < threshold_ms {
            return;
        }
        if let Some(superseded_at) = self.last_supersede_at {
            let quiet = Duration::from_millis(self.cfg.arm_supersede_quiet_ms);
            let since = now.duration_since(superseded_at);
            if since < quiet {
                self.events.push(PlayerEvent::ArmBlocked {
                    quiet_remaining_ms: (quiet - since).as_millis() as u64,
                });
                return;
            }
        }

        let mut lead_ms = self.cfg.start_lead_ms;
        if self.has_armed_once && self.first_play_at.is_some() && self.cfg.sentence_pause_ms > 0 {
            lead_ms += self.cfg.sentence_pause_ms;
            self.events.push(PlayerEvent::PauseInserted {
                ms: self.cfg.sentence_pause_ms,
            });
        }
        self.armed = true;
        self.has_armed_once = true;
        self.lead_silence = util::samples_for_ms(lead_ms, self.device_rate);
        if !self.has_played {
            self.fade_in_total = util::samples_for_ms(self.cfg.fade_in_ms, self.device_rate).max(1);
            self.fade_in_remaining = self.fade_in_total;
        }
        self.underrun_in_episode = false;
        self.queue_low_signaled = false;
        self.events.push(PlayerEvent::PlaybackArmed {
            queued_ms: self.queued_ms(),
            lead_ms,
        });
    }

    // ── cancellation ───────────────────────────────────────────────────

    /// Hard supersede: invalidate everything queued under older epochs.
    /// `context_time` is the host audio-clock reading at the supersede,
    /// carried for diagnostics only.
    pub fn set_epoch(&mut self, epoch: u64, context_time: Option<f64>, now: Instant) {
        if epoch <= self.current_epoch {
            return;
        }
        debug!(epoch, context_time, "supersede");
        self.current_epoch = epoch;
        self.supersede_reset(now);
    }

    /// Prefix-change supersede. Honors `supersede_prefix_enabled`; inside
    /// the commit guard window of recent playback it degrades to a soft
    /// flush so already-heard audio is not yanked. Returns whether the
    /// epoch advanced.
    pub fn prefix_supersede(&mut self, epoch: u64, now: Instant) -> bool {
        if !self.cfg.supersede_prefix_enabled || epoch <= self.current_epoch {
            return false;
        }
        let guarded = self
            .first_play_at
            .map(|t| now.duration_since(t) <= Duration::from_millis(self.cfg.commit_guard_ms))
            .unwrap_or(false);
        self.current_epoch = epoch;
        if guarded {
            self.soft_flush();
            self.last_supersede_at = Some(now);
        } else {
            self.supersede_reset(now);
        }
        true
    }

    fn supersede_reset(&mut self, now: Instant) {
        self.discard_playback_state();
        self.last_supersede_at = Some(now);
    }

    /// Drop everything queued under the old epoch: ring, join tail,
    /// consume cursor, arming, and the fade-in state.
    fn discard_playback_state(&mut self) {
        self.ring.clear();
        self.join.reset();
        self.armed = false;
        self.lead_silence = 0;
        self.resample_pos = 0.0;
        self.resample_prev = None;
        self.has_played = false;
        self.first_play_at = None;
        self.fade_in_remaining = 0;
        self.underrun_in_episode = false;
        self.queue_low_signaled = false;
    }

    /// Drop queued audio but preserve arming state.
    pub fn soft_flush(&mut self) {
        self.ring.clear();
        self.join.reset();
        self.resample_pos = 0.0;
        self.resample_prev = None;
    }

    /// Full reset. The epoch and lifetime counters survive.
    pub fn flush(&mut self) {
        self.ring.clear();
        self.join.reset();
        self.armed = false;
        self.has_armed_once = false;
        self.has_played = false;
        self.lead_silence = 0;
        self.resample_pos = 0.0;
        self.resample_prev = None;
        self.fade_in_remaining = 0;
        self.fade_in_total = 0;
        self.last_supersede_at = None;
        self.first_play_at = None;
        self.underrun_in_episode = false;
        self.queue_low_signaled = false;
    }

    // ── output path ────────────────────────────────────────────────────

    /// Fill `out` with device-rate samples. Silence while disarmed.
    pub fn render(&mut self, out: &mut [f32], now: Instant) {
        self.maybe_diagnostic(now);
        if !self.armed {
            out.fill(0.0);
            return;
        }
        let mut produced = 0;
        for slot in out.iter_mut() {
            if self.lead_silence > 0 {
                self.lead_silence -= 1;
                *slot = 0.0;
                produced += 1;
                continue;
            }
            match self.next_output_sample() {
                Some(sample) => {
                    let sample = self.apply_fade_in(sample);
                    if !self.has_played {
                        self.has_played = true;
                        self.first_play_at = Some(now);
                    }
                    *slot = sample;
                    produced += 1;
                }
                None => {
                    // Underrun: go quiet, disarm, reset the consume cursor.
                    if !self.underrun_in_episode {
                        self.underrun_in_episode = true;
                        self.events.push(PlayerEvent::Underrun);
                    }
                    self.armed = false;
                    self.resample_pos = 0.0;
                    self.resample_prev = None;
                    break;
                }
            }
        }
        for slot in out.iter_mut().skip(produced) {
            *slot = 0.0;
        }
        self.check_queue_low();
    }

    fn next_output_sample(&mut self) -> Option<f32> {
        let step = self.cfg.input_rate as f64 / self.device_rate as f64;
        if self.resample_prev.is_none() {
            self.resample_prev = Some(self.pull_input()?);
            self.resample_pos = 0.0;
        }
        while self.resample_pos >= 1.0 {
            self.resample_prev = Some(self.pull_input()?);
            self.resample_pos -= 1.0;
        }
        let prev = self.resample_prev.unwrap_or(0.0);
        let next = self.ring.peek().unwrap_or(prev);
        let sample = prev + (next - prev) * self.resample_pos as f32;
        self.resample_pos += step;
        Some(sample)
    }

    /// Pop from the ring, releasing the join tail when the ring runs dry.
    fn pull_input(&mut self) -> Option<f32> {
        if let Some(s) = self.ring.pop() {
            return Some(s);
        }
        let tail = self.join.drain_tail();
        if tail.is_empty() {
            return None;
        }
        self.ring.push_slice(&tail);
        self.ring.pop()
    }

    fn apply_fade_in(&mut self, sample: f32) -> f32 {
        if self.fade_in_remaining == 0 {
            return sample;
        }
        let gain = (self.fade_in_total - self.fade_in_remaining) as f32 / self.fade_in_total as f32;
        self.fade_in_remaining -= 1;
        sample * gain
    }

    fn check_queue_low(&mut self) {
        if !self.armed {
            return;
        }
        let queued = self.queued_ms();
        if queued < self.cfg.queue_low_threshold_ms {
            if !self.queue_low_signaled {
                self.queue_low_signaled = true;
                self.events.push(PlayerEvent::QueueLow { queued_ms: queued });
            }
        } else {
            self.queue_low_signaled = false;
        }
    }

    fn maybe_diagnostic(&mut self, now: Instant) {
        let interval = Duration::from_millis(self.cfg.diagnostic_interval_ms);
        let due = match self.last_diag_at {
            Some(t) => now.duration_since(t) >= interval,
            None => true,
        };
        if due {
            self.last_diag_at = Some(now);
            self.events.push(PlayerEvent::Diagnostic {
                queued_ms: self.queued_ms(),
                epoch: self.current_epoch,
                total_dropped: self.total_dropped,
            });
        }
    }
}
