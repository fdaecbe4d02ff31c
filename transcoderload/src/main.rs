mod cli;
mod error;
mod estimator;
mod job;
mod progress;
mod runner;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{fmt, prelude::*};

use crate::cli::Args;
use crate::runner::Runner;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DRAIN_WINDOW: std::time::Duration = std::time::Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let dir = tempfile::TempDir::new()?;
    info!(dir = %dir.path().display(), "created job working directory");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let runner = Runner::new(args.cmd, args.forwarded, dir.path().to_path_buf());
    let runner_handle = tokio::spawn(runner.run(shutdown.clone()));

    shutdown.cancelled().await;
    info!("shutdown signal received, stopping jobs");
    tokio::time::sleep(DRAIN_WINDOW).await;

    let _ = runner_handle.await;

    // `dir` removes its directory tree on drop.
    drop(dir);
    info!("shutdown complete");
    Ok(())
}

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
