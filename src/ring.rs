//! Fixed-capacity mono float FIFO with overwrite-on-full.
//!
//! Owned by a single task (the player core), so this is a plain circular
//! buffer rather than the lock-free variant a cross-thread ring would need.

/// Circular PCM queue. Pushing past capacity overwrites the oldest samples
/// and reports how many were lost.
#[derive(Debug)]
pub struct PcmRing {
    buf: Vec<f32>,
    head: usize,
    len: usize,
    overwritten: u64,
}

impl PcmRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: vec![0.0; capacity],
            head: 0,
            len: 0,
            overwritten: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total samples lost to overwrite since creation or last `clear`.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    /// Append samples, overwriting the oldest when full. Returns the number
    /// of queued samples that were overwritten.
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        let cap = self.buf.len();
        if samples.is_empty() {
            return 0;
        }
        // A slice longer than the whole ring reduces to its tail.
        let src = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };
        let skipped = samples.len() - src.len();

        let overflow = (self.len + src.len()).saturating_sub(cap);
        if overflow > 0 {
            self.drop_oldest(overflow);
        }
        let mut write = (self.head + self.len) % cap;
        for &s in src {
            self.buf[write] = s;
            write = (write + 1) % cap;
        }
        self.len += src.len();
        let lost = overflow + skipped;
        self.overwritten += lost as u64;
        lost
    }

    /// Pop up to `out.len()` samples into `out`; returns the count moved.
    pub fn pop_into(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.buf.len();
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.len -= n;
        n
    }

    /// Oldest queued sample without consuming it.
    pub fn peek(&self) -> Option<f32> {
        if self.len == 0 {
            None
        } else {
            Some(self.buf[self.head])
        }
    }

    /// Pop a single sample.
    pub fn pop(&mut self) -> Option<f32> {
        if self.len == 0 {
            return None;
        }
        let s = self.buf[self.head];
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(s)
    }

    /// Discard the `n` oldest samples.
    pub fn drop_oldest(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.buf.len();
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.overwritten = 0;
    }
}
