use std::time::Duration;

/// What the estimator believes about the run right now. Mirrors the Go
/// original's `State` enum; `Stable` is never produced today (neither is
/// the original's) but is kept for forward observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Growing,
    Stalling,
    Stable,
}

/// Weighted histogram of the largest sustained concurrency, indexed by
/// job-count slot. `index` always points at the probe's current job count
/// minus one; `weight` doubles on every stall and never resets, so probing
/// slows down the longer the run struggles to find a stable ceiling.
pub struct Estimator {
    buckets: Vec<f64>,
    index: usize,
    weight: f64,
    state: EstimatorState,
}

impl Default for Estimator {
    fn default() -> Self {
        Self { buckets: vec![0.0], index: 0, weight: 1.0, state: EstimatorState::Growing }
    }
}

impl Estimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records confidence that `index` jobs are sustainable and advances
    /// the probe to the next job count, growing `buckets` if needed.
    pub fn grow(&mut self) {
        self.buckets[self.index] += self.weight;
        self.state = EstimatorState::Growing;
        self.index += 1;
        if self.index == self.buckets.len() {
            self.buckets.push(0.0);
        }
    }

    /// Withdraws the last confidence increment, steps the probe back one
    /// job count (floored at zero) and doubles the weight, so the next
    /// cycle waits twice as long before committing to a verdict.
    pub fn stall(&mut self) {
        self.buckets[self.index] -= self.weight;
        self.index = self.index.saturating_sub(1);
        self.weight *= 2.0;
    }

    /// `(count, hold_time)` for the next reconciliation: `count` is the job
    /// count the Runner should converge on, `hold_time` the duration to
    /// hold it before growing again.
    pub fn cycle(&self) -> (usize, Duration) {
        let count = self.index + 1;
        let hold_time = Duration::from_secs_f64(self.weight * 20.0);
        (count, hold_time)
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    /// Logs the full confidence histogram, letting an operator read off
    /// the empirically-best job count without re-deriving it from the log
    /// stream.
    pub fn print_stats(&self) {
        tracing::info!(buckets = ?self.buckets, "confidence per job count");
    }
}
