//! Bounded window of recent latency observations.
//!
//! When the window is full, new observations **overwrite** the oldest so the
//! most recent `capacity` values are always the ones averaged.
//!
//! # Example
//!
//! ```rust
//! use voice_duplex::playback::LatencyHistory;
//!
//! let mut h = LatencyHistory::new(3);
//! for v in [1.0, 2.0, 3.0, 4.0] {
//!     h.push(v);
//! }
//! assert_eq!(h.len(), 3);
//! assert!((h.average() - 3.0).abs() < 1e-12);
//! ```

// ---------------------------------------------------------------------------
// LatencyHistory
// ---------------------------------------------------------------------------

/// Fixed-capacity circular window of `f64` observations.
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    buf: Vec<f64>,
    capacity: usize,
    /// Index of the *next* write position (wraps around `capacity`).
    write_pos: usize,
    /// Number of valid observations (≤ `capacity`).
    len: usize,
}

impl LatencyHistory {
    /// A `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0.0; capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.buf[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Mean of the stored observations, 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.values().sum::<f64>() / self.len as f64
    }

    /// Observations in chronological order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        // Before the first wrap valid data starts at 0; afterwards the oldest
        // value sits at `write_pos`.
        let read_pos = if self.len < self.capacity {
            0
        } else {
            self.write_pos
        };
        (0..self.len).map(move |i| self.buf[(read_pos + i) % self.capacity])
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_average_is_zero() {
        let h = LatencyHistory::new(4);
        assert!(h.is_empty());
        assert_eq!(h.average(), 0.0);
    }

    #[test]
    fn average_within_capacity() {
        let mut h = LatencyHistory::new(4);
        h.push(0.1);
        h.push(0.3);
        assert_eq!(h.len(), 2);
        assert!((h.average() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn overflow_keeps_most_recent_in_order() {
        let mut h = LatencyHistory::new(3);
        for v in 1..=5 {
            h.push(f64::from(v));
        }
        assert_eq!(h.values().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn clear_resets() {
        let mut h = LatencyHistory::new(2);
        h.push(1.0);
        h.push(2.0);
        h.push(3.0);
        h.clear();
        assert!(h.is_empty());
        h.push(7.0);
        assert_eq!(h.values().collect::<Vec<_>>(), vec![7.0]);
    }

    #[test]
    fn zero_capacity_is_one() {
        let mut h = LatencyHistory::new(0);
        assert_eq!(h.capacity(), 1);
        h.push(1.0);
        h.push(2.0);
        assert_eq!(h.values().collect::<Vec<_>>(), vec![2.0]);
    }
}
