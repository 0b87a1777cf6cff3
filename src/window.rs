//! Fade kernels and level helpers for the playback path.
//!
//! All curves are raised-cosine; the equal-power blend takes the square
//! root of the window so the summed energy across a join stays flat.

use std::f32::consts::PI;

/// Raised-cosine window value for t in [0, 1]: 0 at t=0, 1 at t=1.
#[inline]
fn raised_cosine(t: f32) -> f32 {
    0.5 * (1.0 - (PI * t).cos())
}

/// Apply an in-place fade-in over the first `n` samples.
pub fn apply_fade_in(samples: &mut [f32], n: usize) {
    let n = n.min(samples.len());
    if n == 0 {
        return;
    }
    for (i, s) in samples.iter_mut().take(n).enumerate() {
        *s *= raised_cosine((i + 1) as f32 / (n + 1) as f32);
    }
}

/// Apply an in-place fade-out over the last `n` samples.
pub fn apply_fade_out(samples: &mut [f32], n: usize) {
    let len = samples.len();
    let n = n.min(len);
    if n == 0 {
        return;
    }
    for i in 0..n {
        let t = (i + 1) as f32 / (n + 1) as f32;
        samples[len - n + i] *= 1.0 - raised_cosine(t);
    }
}

/// Equal-power raised-cosine blend of two equal-length slices.
pub fn equal_power_crossfade(tail: &[f32], head: &[f32]) -> Vec<f32> {
    debug_assert_eq!(tail.len(), head.len());
    let n = tail.len().min(head.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let w = raised_cosine((i + 1) as f32 / (n + 1) as f32);
        out.push(tail[i] * (1.0 - w).sqrt() + head[i] * w.sqrt());
    }
    out
}

/// Root-mean-square level of a slice. Zero for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Peak absolute level of a slice.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// Index just past the first zero crossing within `samples[..max]`, if any.
/// A crossing is a sign change or an exact zero sample.
pub fn first_zero_crossing(samples: &[f32], max: usize) -> Option<usize> {
    let max = max.min(samples.len());
    if max == 0 {
        return None;
    }
    if samples[0] == 0.0 {
        return Some(0);
    }
    for i in 1..max {
        if samples[i] == 0.0 || (samples[i - 1] < 0.0) != (samples[i] < 0.0) {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fade_in_monotone() {
        let mut buf = vec![1.0f32; 10];
        apply_fade_in(&mut buf, 5);
        for i in 1..5 {
            assert!(buf[i] > buf[i - 1]);
        }
        assert!(buf[4] < 1.0);
        assert_eq!(buf[5], 1.0);
    }

    #[test]
    fn test_fade_out_reaches_near_zero() {
        let mut buf = vec![1.0f32; 10];
        apply_fade_out(&mut buf, 4);
        assert_eq!(buf[5], 1.0);
        assert!(buf[9] < 0.2);
        for i in 7..10 {
            assert!(buf[i] < buf[i - 1]);
        }
    }

    #[test]
    fn test_crossfade_constant_signal_stays_level() {
        // Blending a constant with itself should stay close to the input.
        let tail = vec![0.5f32; 64];
        let head = vec![0.5f32; 64];
        let out = equal_power_crossfade(&tail, &head);
        for s in out {
            assert!(s > 0.45 && s < 0.55, "level dipped to {}", s);
        }
    }

    #[test]
    fn test_rms_and_peak() {
        assert_eq!(rms(&[]), 0.0);
        let buf = [0.5f32, -0.5, 0.5, -0.5];
        assert!((rms(&buf) - 0.5).abs() < 1e-6);
        assert_eq!(peak(&buf), 0.5);
        assert_eq!(peak(&[-0.9, 0.3]), 0.9);
    }

    #[test]
    fn test_zero_crossing_search() {
        assert_eq!(first_zero_crossing(&[0.4, 0.2, -0.1, -0.3], 4), Some(2));
        assert_eq!(first_zero_crossing(&[0.0, 0.2], 2), Some(0));
        assert_eq!(first_zero_crossing(&[0.4, 0.3, 0.2], 3), None);
        assert_eq!(first_zero_crossing(&[0.4, -0.1], 1), None);
        assert_eq!(first_zero_crossing(&[], 8), None);
    }
}
