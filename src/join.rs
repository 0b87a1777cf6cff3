//! Join scheduler: decides how much crossfade each chunk boundary needs.
//!
//! The scheduler holds back a short tail from every processed chunk so the
//! next push can be blended against it. Crossfade length scales with the
//! local RMS discontinuity; near-continuous joins are plain appends.

use crate::config::PlayerConfig;
use crate::util;
use crate::window;

/// Join outcome for one boundary, surfaced as a `join_metrics` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinDecision {
    pub crossfade_samples: usize,
    pub rms_delta: f32,
}

#[derive(Debug)]
pub struct JoinScheduler {
    rms_window: usize,
    min_xfade: usize,
    max_xfade: usize,
    tail_reserve: usize,
    delta_floor: f32,
    delta_span: f32,
    join_count: u32,
    pending_tail: Vec<f32>,
}

impl JoinScheduler {
    pub fn new(cfg: &PlayerConfig) -> Self {
        Self {
            rms_window: util::samples_for_ms(cfg.rms_window_ms, cfg.input_rate).max(1),
            min_xfade: util::samples_for_ms(cfg.crossfade_min_ms, cfg.input_rate),
            max_xfade: util::samples_for_ms(cfg.crossfade_max_ms, cfg.input_rate).max(1),
            tail_reserve: util::samples_for_ms(cfg.crossfade_max_ms, cfg.input_rate).max(1),
            delta_floor: cfg.rms_delta_floor,
            delta_span: cfg.rms_delta_span,
            join_count: 0,
            pending_tail: Vec::new(),
        }
    }

    /// Join a chunk against the reserved tail. Returns the samples that are
    /// ready for the ring (a fresh tail is held back) and the join decision,
    /// absent during warmup.
    pub fn process(&mut self, chunk: Vec<f32>) -> (Vec<f32>, Option<JoinDecision>) {
        let mut decision = None;
        let mut joined;

        if self.join_count < 2 || self.pending_tail.is_empty() {
            // Warmup: the first two chunks after a reset append directly.
            joined = std::mem::take(&mut self.pending_tail);
            joined.extend_from_slice(&chunk);
        } else {
            let tail = std::mem::take(&mut self.pending_tail);
            let n = self.rms_window.min(tail.len()).min(chunk.len());
            let rms_before = window::rms(&tail[tail.len() - n..]);
            let rms_after = window::rms(&chunk[..n]);
            let delta = (rms_before - rms_after).abs();

            if delta < self.delta_floor {
                joined = tail;
                joined.extend_from_slice(&chunk);
                decision = Some(JoinDecision {
                    crossfade_samples: 0,
                    rms_delta: delta,
                });
            } else {
                let ratio = (delta / self.delta_span).min(1.0);
                let span = self.max_xfade.saturating_sub(self.min_xfade);
                let scaled = self.min_xfade + (span as f32 * ratio).round() as usize;
                let x = scaled
                    .max(self.min_xfade)
                    .min(self.max_xfade)
                    .min(tail.len())
                    .min(chunk.len());

                let keep = tail.len() - x;
                joined = Vec::with_capacity(keep + x + chunk.len() - x);
                joined.extend_from_slice(&tail[..keep]);
                joined.extend(window::equal_power_crossfade(&tail[keep..], &chunk[..x]));
                joined.extend_from_slice(&chunk[x..]);
                decision = Some(JoinDecision {
                    crossfade_samples: x,
                    rms_delta: delta,
                });
            }
        }
        self.join_count = self.join_count.saturating_add(1);

        let reserve = self.tail_reserve.min(joined.len());
        self.pending_tail = joined.split_off(joined.len() - reserve);
        (joined, decision)
    }

    /// Release the reserved tail, e.g. when the queue runs dry.
    pub fn drain_tail(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.pending_tail)
    }

    /// Drop the tail and restart warmup.
    pub fn reset(&mut self) {
        self.pending_tail.clear();
        self.join_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> JoinScheduler {
        JoinScheduler::new(&PlayerConfig::default())
    }

    #[test]
    fn test_warmup_appends_without_decision() {
        let mut join = scheduler();
        let (ready, decision) = join.process(vec![0.1; 2400]);
        assert!(decision.is_none());
        // 20 ms tail (480 samples at 24 kHz) held back.
        assert_eq!(ready.len(), 2400 - 480);

        let (ready, decision) = join.process(vec![0.1; 2400]);
        assert!(decision.is_none());
        assert_eq!(ready.len(), 2400);
    }

    #[test]
    fn test_continuous_signal_appends() {
        let mut join = scheduler();
        join.process(vec![0.2; 2400]);
        join.process(vec![0.2; 2400]);
        let (ready, decision) = join.process(vec![0.2; 2400]);
        let decision = decision.expect("past warmup");
        assert_eq!(decision.crossfade_samples, 0);
        assert!(decision.rms_delta < 0.02);
        assert_eq!(ready.len(), 2400);
    }

    #[test]
    fn test_discontinuity_gets_max_crossfade() {
        let mut join = scheduler();
        join.process(vec![0.8; 2400]);
        join.process(vec![0.8; 2400]);
        let (ready, decision) = join.process(vec![0.0; 2400]);
        let decision = decision.expect("past warmup");
        // |Δrms| = 0.8 saturates the ramp: full 20 ms fade.
        assert_eq!(decision.crossfade_samples, 480);
        assert!((decision.rms_delta - 0.8).abs() < 1e-3);
        // A crossfade of x samples shortens the output by x.
        assert_eq!(ready.len(), 2400 - 480);
    }

    #[test]
    fn test_moderate_delta_scales_between_bounds() {
        let mut join = scheduler();
        join.process(vec![0.10; 2400]);
        join.process(vec![0.10; 2400]);
        let (_, decision) = join.process(vec![0.04; 2400]);
        let decision = decision.expect("past warmup");
        // Δ = 0.06 → ratio 0.5 → 12 + 4 = 16 ms ≈ 384 samples.
        assert!(decision.crossfade_samples > 288 && decision.crossfade_samples < 480);
    }

    #[test]
    fn test_reset_restores_warmup() {
        let mut join = scheduler();
        join.process(vec![0.5; 2400]);
        join.process(vec![0.5; 2400]);
        join.reset();
        let (_, decision) = join.process(vec![0.5; 2400]);
        assert!(decision.is_none());
    }

    #[test]
    fn test_drain_tail_empties_reserve() {
        let mut join = scheduler();
        join.process(vec![0.3; 2400]);
        let tail = join.drain_tail();
        assert_eq!(tail.len(), 480);
        assert!(join.drain_tail().is_empty());
    }
}
