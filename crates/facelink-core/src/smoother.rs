//! Anti-shake temporal smoothing of per-face point sequences.
//!
//! Keeps a bounded history of recent point-sets (newest first) and reports
//! their integer mean. A large jump between the newest and oldest entry
//! resets the history so the average snaps to the new position instead of
//! dragging behind it.

use std::collections::VecDeque;

/// Default history capacity.
pub const DEFAULT_ANTI_SHAKE_SAMPLES: usize = 1;

/// Default reset threshold in pixels.
pub const DEFAULT_JITTER_DELTA: i32 = 30;

/// Bounded history of point-sets with a stabilized average.
///
/// The history holds at most `capacity + 1` entries: eviction happens
/// before the new entry is inserted.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    capacity: usize,
    history: VecDeque<Vec<i32>>,
}

impl TemporalSmoother {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity + 2),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Push `points` as the newest entry.
    ///
    /// With `jitter_delta > 0`, if the first (x, y) pair of the newest and
    /// oldest entries differ by at least `jitter_delta` on either axis, the
    /// history is cleared and `points` is stored twice.
    pub fn add(&mut self, points: Vec<i32>, jitter_delta: i32) {
        while self.history.len() > self.capacity {
            self.history.pop_back();
        }
        self.history.push_front(points);

        if self.shifted(jitter_delta) {
            let points = self.history.pop_front().unwrap_or_default();
            self.history.clear();
            self.history.push_front(points.clone());
            self.history.push_front(points);
        }
    }

    fn shifted(&self, jitter_delta: i32) -> bool {
        if jitter_delta == 0 || self.history.len() < 2 {
            return false;
        }
        let (Some(newest), Some(oldest)) = (self.history.front(), self.history.back()) else {
            return false;
        };
        if newest.len() < 2 || oldest.len() < 2 {
            return false;
        }
        (newest[0] - oldest[0]).abs() >= jitter_delta || (newest[1] - oldest[1]).abs() >= jitter_delta
    }

    /// Integer-truncated mean of every stored point-set, per coordinate.
    pub fn average(&self) -> Vec<i32> {
        match self.history.len() {
            0 => Vec::new(),
            1 => self.history[0].clone(),
            n => {
                let width = self.history[0].len();
                let mut sums = vec![0i64; width];
                for points in &self.history {
                    for (sum, &v) in sums.iter_mut().zip(points.iter()) {
                        *sum += v as i64;
                    }
                }
                sums.into_iter().map(|s| (s / n as i64) as i32).collect()
            }
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
