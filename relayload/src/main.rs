mod cli;
mod error;
mod http;
mod limiter;
mod playlist;
mod stats;
mod task;
mod url_resolve;
mod worker;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{fmt, prelude::*};

use crate::cli::Args;
use crate::http::build_client;
use crate::playlist::PlaylistLoader;
use crate::task::Task;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Channel capacities fixed by spec.md §5, independent of worker count.
const TASK_QUEUE_CAPACITY: usize = 50;
const RESULTS_QUEUE_CAPACITY: usize = 10_000;

/// Drain window after a shutdown signal before the process joins every
/// spawned task, matching spec.md §6's "200 ms drain" exit contract.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let auth = args.auth_config();
    let (tasks_tx, tasks_rx) = mpsc::channel::<Arc<Task>>(TASK_QUEUE_CAPACITY);
    let (results_tx, results_rx) = mpsc::channel(RESULTS_QUEUE_CAPACITY);
    // spec.md's zero-capacity rendezvous channel has no direct tokio::mpsc
    // equivalent (tokio panics on a zero-capacity channel); capacity 1 gives
    // the same backpressure in practice, since the loader only ever sends
    // one tick per iteration and always awaits the stats collector to drain
    // it before the next.
    let (iteration_tx, iteration_rx) = mpsc::channel::<()>(1);
    let last_limit = Arc::new(AtomicU32::new(0));

    let limiter = crate::limiter::spawn(
        args.limit_mode(),
        args.urls.len(),
        args.sample,
        args.workers,
        Arc::clone(&last_limit),
        shutdown.clone(),
    );

    let stats = crate::stats::StatsCollector::new(
        results_rx,
        iteration_rx,
        Arc::clone(&last_limit),
        shutdown.clone(),
    );
    let stats_handle = tokio::spawn(stats.run());

    let tasks_rx = Arc::new(Mutex::new(tasks_rx));
    let mut worker_handles = Vec::with_capacity(args.workers);
    for id in 0..args.workers {
        let client = build_client(args.segment_duration)?;
        worker_handles.push(tokio::spawn(crate::worker::run(
            id,
            client,
            auth.clone(),
            args.segment_duration,
            Arc::clone(&tasks_rx),
            Arc::clone(&limiter),
            results_tx.clone(),
            shutdown.clone(),
        )));
    }
    drop(results_tx);

    let loader_client = build_client(args.segment_duration)?;
    let loader = PlaylistLoader::new(
        loader_client,
        auth,
        args.sample,
        args.factor,
        args.segment_duration,
        tasks_tx,
    );

    let loader_handle = tokio::spawn(run_loader(
        loader,
        args.urls.clone(),
        args.segment_duration,
        iteration_tx,
        shutdown.clone(),
    ));

    shutdown.cancelled().await;
    info!("shutdown signal received, draining in-flight requests");
    tokio::time::sleep(DRAIN_WINDOW).await;

    let _ = loader_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;

    info!("shutdown complete");
    Ok(())
}

/// Drives one playlist iteration per `segment_duration` across every
/// configured URL, signaling the stats collector once a full pass
/// completes. Parse errors from a single URL are logged and the run
/// continues with the rest.
async fn run_loader(
    loader: PlaylistLoader,
    urls: Vec<String>,
    segment_duration: Duration,
    iteration_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(segment_duration);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        for url in &urls {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(err) = loader.load(&shutdown, url).await {
                warn!(%url, %err, "playlist load failed");
            }
        }

        if iteration_tx.send(()).await.is_err() {
            return;
        }
    }
}

/// Races SIGINT/SIGTERM into `shutdown`; SIGHUP is registered and ignored
/// so an operator's accidental `killall -HUP` doesn't tear down a run.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sighup = signal(SignalKind::hangup()).ok();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    shutdown.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    shutdown.cancel();
                    return;
                }
                _ = async {
                    match sighup.as_mut() {
                        Some(s) => { s.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("SIGHUP received, ignoring");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}
