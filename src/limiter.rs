//! Adaptive rate limiter for client audio forwarded upstream.
//!
//! Each 429-like upstream signal bumps the penalty level; audio is dropped
//! until the penalty window expires. Successful sends walk the level back
//! down one step at a time.

use std::time::{Duration, Instant};

const MAX_PENALTY_LEVEL: u32 = 5;

#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    penalty_level: u32,
    penalty_expires_at: Option<Instant>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self {
            penalty_level: 0,
            penalty_expires_at: None,
        }
    }

    /// Whether a send is currently allowed.
    pub fn allow_send(&self, now: Instant) -> bool {
        match self.penalty_expires_at {
            Some(expires) => now >= expires,
            None => true,
        }
    }

    /// Record a rate-limit signal: raise the level and start a new window.
    pub fn mark_rate_limited(&mut self, now: Instant) {
        self.penalty_level = (self.penalty_level + 1).min(MAX_PENALTY_LEVEL);
        let window = Duration::from_millis(self.penalty_level as u64 * 1000 + 500);
        self.penalty_expires_at = Some(now + window);
    }

    /// Record a successful send: decay one level; clear expiry at level 0.
    pub fn mark_success(&mut self) {
        if self.penalty_level > 0 {
            self.penalty_level -= 1;
        }
        if self.penalty_level == 0 {
            self.penalty_expires_at = None;
        }
    }

    pub fn penalty_level(&self) -> u32 {
        self.penalty_level
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
