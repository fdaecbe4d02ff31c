use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::JobError;
use crate::estimator::Estimator;
use crate::job::Job;

/// Closes the loop between [`Estimator`] and [`Job`]: asks the estimator
/// for the next `(count, hold)` cycle, reconciles the running job set
/// against `count`, then races shutdown, a job-stall notification, and the
/// hold timer.
pub struct Runner {
    estimator: Estimator,
    jobs: Vec<Job>,
    cmd: String,
    forwarded_args: Vec<String>,
    dir: std::path::PathBuf,
    next_id: u32,
}

impl Runner {
    pub fn new(cmd: String, forwarded_args: Vec<String>, dir: std::path::PathBuf) -> Self {
        Self { estimator: Estimator::new(), jobs: Vec::new(), cmd, forwarded_args, dir, next_id: 1 }
    }

    /// Always dumps the estimator's confidence histogram once on the way
    /// out, successful or not, matching `state.go::PrintStats` being called
    /// from `Runner.run`'s `defer` in the original.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);
        self.run_inner(shutdown, &notify_tx, &mut notify_rx).await;
        self.estimator.print_stats();
    }

    async fn run_inner(
        &mut self,
        shutdown: CancellationToken,
        notify_tx: &mpsc::Sender<()>,
        notify_rx: &mut mpsc::Receiver<()>,
    ) {
        loop {
            let (count, hold) = self.estimator.cycle();
            let diff = count.saturating_sub(self.jobs.len());
            info!(count, diff, hold_secs = hold.as_secs_f64(), "reconciling job count");

            for _ in 0..diff {
                if shutdown.is_cancelled() {
                    self.stop_all().await;
                    return;
                }
                match self.launch_one(notify_tx, &shutdown).await {
                    Ok(job) => self.jobs.push(job),
                    Err(err) => {
                        tracing::error!(%err, "failed to launch transcoder job");
                        self.stop_all().await;
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            if shutdown.is_cancelled() {
                self.stop_all().await;
                return;
            }

            let timer = tokio::time::sleep(hold);
            tokio::pin!(timer);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.stop_all().await;
                    return;
                }
                _ = notify_rx.recv() => {
                    drain(notify_rx);
                    self.stop_all().await;
                    self.estimator.stall();
                }
                _ = &mut timer => {
                    self.estimator.grow();
                }
            }
        }
    }

    async fn launch_one(
        &mut self,
        notify_tx: &mpsc::Sender<()>,
        shutdown: &CancellationToken,
    ) -> Result<Job, JobError> {
        let name = format!("ffmpeg{}", self.next_id);
        self.next_id += 1;
        let job = Job::launch(
            name,
            &self.dir,
            &self.cmd,
            &self.forwarded_args,
            notify_tx.clone(),
            shutdown,
        )
        .await?;
        info!(job = %job.name, "job launched");
        Ok(job)
    }

    async fn stop_all(&mut self) {
        for job in self.jobs.drain(..) {
            job.stop().await;
        }
    }
}

/// Coalesces any further pending stall notifications sent while we were
/// already handling one.
fn drain(rx: &mut mpsc::Receiver<()>) {
    while rx.try_recv().is_ok() {}
}
