//! Fixed-capacity rolling window of observations

use std::collections::VecDeque;

/// Ring buffer keeping the most recent `capacity` observations
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    /// Create an empty window; a zero capacity is treated as one
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Append an observation, dropping the oldest when full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= oldest;
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Mean of the window, `None` when empty
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum / self.samples.len() as f64)
    }

    /// Number of observations held
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no observations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum observations held
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
