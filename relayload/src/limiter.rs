use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the target rate is chosen. Mirrors the `-limit` flag's three modes.
#[derive(Debug, Clone, Copy)]
pub enum LimitMode {
    /// `-limit 0`: the endpoint is treated as permanently available, no
    /// worker ever waits for a token.
    Unlimited,
    /// `-limit N`, `N > 0`: a fixed rate of `N` requests/second.
    Fixed(u32),
    /// `-limit -1`: seeded from the URL count and `-sample`, then adjusted
    /// every second from the previous second's observed hit count.
    Auto,
}

/// Token-bucket rate limiter shared by all workers. Tokens are produced by
/// [`run`] into a bounded channel; a full channel simply drops the tick,
/// which is how backpressure keeps the bucket from growing unbounded ahead
/// of worker demand.
pub enum Limiter {
    Unlimited,
    Bounded(Mutex<mpsc::Receiver<()>>),
}

impl Limiter {
    /// Waits for a token. Returns `None` once the producer side has shut
    /// down and no more tokens will ever arrive.
    pub async fn acquire(&self) -> Option<()> {
        match self {
            Limiter::Unlimited => Some(()),
            Limiter::Bounded(rx) => rx.lock().await.recv().await,
        }
    }
}

/// Spawns the rate-control task and returns the shared [`Limiter`] handle
/// workers acquire tokens from.
///
/// `initial_urls` and `sample` only matter for [`LimitMode::Auto`]'s seed
/// rate (`max(50, urls*50/sample)`); `worker_count` sizes the bucket.
pub fn spawn(
    mode: LimitMode,
    initial_urls: usize,
    sample: u32,
    worker_count: usize,
    last_limit: Arc<AtomicU32>,
    shutdown: CancellationToken,
) -> Arc<Limiter> {
    let LimitMode::Unlimited = mode else {
        let (tx, rx) = mpsc::channel::<()>(worker_count.max(1));
        let limiter = Arc::new(Limiter::Bounded(Mutex::new(rx)));
        let rate = match mode {
            LimitMode::Fixed(r) => r,
            LimitMode::Auto => auto_seed_rate(initial_urls as u32, sample),
            LimitMode::Unlimited => unreachable!(),
        };
        tokio::spawn(run(tx, rate, matches!(mode, LimitMode::Auto), last_limit, shutdown));
        return limiter;
    };
    Arc::new(Limiter::Unlimited)
}

async fn run(
    tx: mpsc::Sender<()>,
    initial_rate: u32,
    auto: bool,
    last_limit: Arc<AtomicU32>,
    shutdown: CancellationToken,
) {
    let mut rate = initial_rate.max(1);
    let mut tick = tokio::time::interval(tick_period(rate));
    let mut reset = tokio::time::interval(Duration::from_secs(1));
    reset.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {
                // Dropped silently if the bucket is already full.
                let _ = tx.try_send(());
            }
            _ = reset.tick(), if auto => {
                rate = reseed_rate(last_limit.load(Ordering::Relaxed));
                debug!(rate, "auto rate limit reseeded");
                tick = tokio::time::interval(tick_period(rate));
            }
        }
    }
}

/// `-limit -1`'s initial seed: `max(50, len(urls)*50/sample)`.
fn auto_seed_rate(urls: u32, sample: u32) -> u32 {
    (urls.saturating_mul(50) / sample.max(1)).max(50)
}

/// `-limit -1`'s per-second reseed: `max(50, lastHits) * 1.2`.
fn reseed_rate(last_hits: u32) -> u32 {
    ((last_hits.max(50) as f64) * 1.2) as u32
}

fn tick_period(rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / rate.max(1) as f64)
}
