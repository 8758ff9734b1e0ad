//! Fixed-capacity sample history for calibration and diagnostics.
//!
//! The history buffer is *not* part of the control path: the cycle controller
//! only ever sees the latest conditioned value. History exists so the
//! conditioner can average a quiet window into a tare offset and estimate
//! sensor noise for diagnostics.

use std::collections::VecDeque;

use crate::core::Sample;

/// A bounded circular window of [`Sample`]s, oldest evicted first.
#[derive(Clone, Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    buffer: VecDeque<Sample>,
}

impl HistoryBuffer {
    /// Create a buffer holding at most `capacity` samples.
    ///
    /// A zero capacity is clamped to one so `push` always retains something.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: Sample) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The newest sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        self.buffer.back().copied()
    }

    /// Mean of the values of all samples with `t >= since`.
    ///
    /// Returns `None` when no sample falls inside the window; callers must
    /// not treat an empty window as a valid zero offset.
    pub fn mean_since(&self, since: f64) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for sample in self.buffer.iter().rev() {
            if sample.t < since {
                break;
            }
            sum += sample.value;
            count += 1;
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }

    /// Population variance of all held values, for noise estimation.
    pub fn variance(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        let n = self.buffer.len() as f64;
        let mean = self.buffer.iter().map(|s| s.value).sum::<f64>() / n;
        let var = self
            .buffer
            .iter()
            .map(|s| {
                let d = s.value - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(var)
    }

    /// Iterate over held samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.buffer.iter()
    }
}
