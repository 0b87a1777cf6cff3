//! Jittered exponential backoff for upstream reconnects.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    cap: Duration,
    /// Symmetric jitter fraction, e.g. 0.2 for ±20%. Zero disables.
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, cap: Duration, jitter: f64) -> Self {
        Self {
            initial,
            multiplier,
            cap,
            jitter,
            attempt: 0,
        }
    }

    /// The reconnect ladder the proxy uses: 500 ms doubling to a 15 s cap,
    /// ±20% jitter.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(500), 2.0, Duration::from_secs(15), 0.2)
    }

    /// Delay for the next attempt; increments the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.initial.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let base = exp.min(self.cap.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
