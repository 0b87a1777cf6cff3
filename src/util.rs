//! Small PCM and identifier helpers shared across the proxy.

use rand::RngCore;

/// Convert raw 16-bit little-endian PCM bytes to mono f32 samples in [-1, 1].
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// Convert raw 16-bit little-endian PCM bytes to i16 samples.
pub fn pcm16_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Reinterpret an i16 slice as its little-endian byte representation.
pub fn i16_slice_to_u8(slice: &[i16]) -> &[u8] {
    // SAFETY: i16 has no invalid bit patterns and the length is exact.
    unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * 2) }
}

/// Milliseconds of audio represented by `bytes` of PCM16 at `sample_rate`.
pub fn duration_ms_for_bytes(bytes: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    ((bytes / 2) as f64 / sample_rate as f64 * 1000.0).round() as u64
}

/// Sample count for a duration in milliseconds at the given rate.
pub fn samples_for_ms(ms: u64, sample_rate: u32) -> usize {
    (ms as u128 * sample_rate as u128 / 1000) as usize
}

/// Random lowercase-hex string of `n_bytes * 2` characters.
pub fn hex_id(n_bytes: usize) -> String {
    use std::fmt::Write;
    let mut buf = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(n_bytes * 2);
    for b in buf {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Truncate a close reason to at most `max` bytes on a char boundary.
pub fn truncate_reason(reason: &str, max: usize) -> String {
    if reason.len() <= max {
        return reason.to_string();
    }
    let mut end = max;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
