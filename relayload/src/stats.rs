use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::task::TaskOutcome;

/// Aggregates `TaskOutcome`s into a per-iteration summary and feeds the
/// observed hit count back to the rate limiter's auto-mode via
/// `last_limit`.
pub struct StatsCollector {
    results_rx: mpsc::Receiver<TaskOutcome>,
    iteration_rx: mpsc::Receiver<()>,
    last_limit: Arc<AtomicU32>,
    shutdown: CancellationToken,
}

impl StatsCollector {
    pub fn new(
        results_rx: mpsc::Receiver<TaskOutcome>,
        iteration_rx: mpsc::Receiver<()>,
        last_limit: Arc<AtomicU32>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { results_rx, iteration_rx, last_limit, shutdown }
    }

    pub async fn run(mut self) {
        let mut window = Window::default();
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                tick = self.iteration_rx.recv() => {
                    if tick.is_none() {
                        return;
                    }
                    let elapsed = window_start.elapsed().as_secs_f64().max(0.001);
                    window.report(elapsed);
                    self.last_limit.store(window.hits as u32, Ordering::Relaxed);
                    window = Window::default();
                    window_start = Instant::now();
                }
                outcome = self.results_rx.recv() => {
                    let Some(outcome) = outcome else { return };
                    window.record(outcome);
                }
            }
        }
    }
}

#[derive(Default)]
struct Window {
    hits: u64,
    errors: u64,
    fails: u64,
    bytes: u64,
}

impl Window {
    fn record(&mut self, outcome: TaskOutcome) {
        self.bytes += outcome.size;
        match (outcome.err, outcome.code) {
            (Some(_), _) => self.fails += 1,
            (None, 200) => self.hits += 1,
            (None, _) => self.errors += 1,
        }
    }

    fn report(&self, elapsed_secs: f64) {
        let bits_per_sec = (self.bytes as f64 / 1_048_576.0) * 8.0 / elapsed_secs;
        let ops_per_sec = self.hits as f64 / elapsed_secs;
        info!(
            success = self.hits,
            errors = self.errors,
            fails = self.fails,
            rate = format!("{bits_per_sec:.2} Mbit/s"),
            ops = format!("{ops_per_sec:.2} req/s"),
            "iteration complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_buckets_outcomes_by_transport_error_then_status_code() {
        let mut window = Window::default();
        window.record(TaskOutcome::response(200, 1024));
        window.record(TaskOutcome::response(200, 2048));
        window.record(TaskOutcome::response(404, 0));
        window.record(TaskOutcome::transport_error("connection reset".to_string()));

        assert_eq!(window.hits, 2);
        assert_eq!(window.errors, 1);
        assert_eq!(window.fails, 1);
        assert_eq!(window.bytes, 3072);
    }

    #[tokio::test]
    async fn iteration_tick_publishes_hits_and_resets_the_window() {
        let (results_tx, results_rx) = mpsc::channel(8);
        let (iteration_tx, iteration_rx) = mpsc::channel(1);
        let last_limit = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let collector =
            StatsCollector::new(results_rx, iteration_rx, Arc::clone(&last_limit), shutdown.clone());
        let handle = tokio::spawn(collector.run());

        results_tx.send(TaskOutcome::response(200, 10)).await.unwrap();
        results_tx.send(TaskOutcome::response(200, 10)).await.unwrap();
        results_tx.send(TaskOutcome::response(500, 0)).await.unwrap();

        iteration_tx.send(()).await.unwrap();
        // Give the collector a beat to process the tick before asserting.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(last_limit.load(Ordering::Relaxed), 2);

        shutdown.cancel();
        let _ = handle.await;
    }
}
