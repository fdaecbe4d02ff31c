mod dash;
mod hls;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::error::LoaderError;
use crate::http::AuthConfig;
use crate::task::Task;

/// The per-iteration deadline + shutdown pair every send and every nested
/// fetch in one `PlaylistLoader::load` call races against. One is created
/// per top-level call and threaded through recursive HLS variant fetches,
/// matching how the Go original derives a single child context per `Load`
/// and reuses it for the whole call tree.
#[derive(Clone)]
pub(crate) struct IterationDeadline {
    deadline: Instant,
    shutdown: CancellationToken,
}

impl IterationDeadline {
    fn new(segment_duration: Duration, shutdown: CancellationToken) -> Self {
        Self { deadline: Instant::now() + segment_duration, shutdown }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves once the iteration's deadline passes or shutdown fires.
    async fn expired(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline.into()) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

pub struct PlaylistLoader {
    client: Client,
    auth: AuthConfig,
    sample: u32,
    factor: u32,
    segment_duration: Duration,
    tasks_tx: mpsc::Sender<Arc<Task>>,
}

impl PlaylistLoader {
    pub fn new(
        client: Client,
        auth: AuthConfig,
        sample: u32,
        factor: u32,
        segment_duration: Duration,
        tasks_tx: mpsc::Sender<Arc<Task>>,
    ) -> Self {
        Self {
            client,
            auth,
            sample: sample.max(1),
            factor: factor.max(1),
            segment_duration,
            tasks_tx,
        }
    }

    /// Fetches `url` and every segment/sub-playlist it names, queueing one
    /// `Task` per eligible segment (`factor` times each). Returns `Ok(())`
    /// even when the playlist couldn't be fetched or parsed meaningfully —
    /// those failures are logged, not propagated, so one bad URL in a
    /// multi-URL run doesn't abort the others. Only malformed input
    /// (unparsable URL, unrecognized extension, manifest missing a
    /// required field) is returned as an error.
    pub async fn load(&self, shutdown: &CancellationToken, url_str: &str) -> Result<(), LoaderError> {
        let url = Url::parse(url_str)
            .map_err(|source| LoaderError::MalformedUrl { url: url_str.to_string(), source })?;
        let iteration = IterationDeadline::new(self.segment_duration, shutdown.clone());
        self.get(&iteration, &url).await
    }

    async fn get(&self, iteration: &IterationDeadline, url: &Url) -> Result<(), LoaderError> {
        let resp = match self.fetch_playlist(url).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%url, %err, "playlist fetch failed");
                return Ok(());
            }
        };
        if !resp.status().is_success() {
            warn!(%url, status = %resp.status(), "non-success playlist response");
            return Ok(());
        }
        let body = resp.bytes().await?;

        let ext = url.path().rsplit('.').next().unwrap_or("");
        match ext {
            "mpd" => dash::handle(self, iteration, url, &body).await,
            "m3u8" => hls::handle(self, iteration, url, &body).await,
            _ => Err(LoaderError::UnknownFormat { url: url.to_string() }),
        }
    }

    async fn fetch_playlist(&self, url: &Url) -> Result<reqwest::Response, reqwest::Error> {
        let req = self.auth.apply(self.client.get(url.clone()).timeout(self.segment_duration));
        req.send().await
    }

    /// Queues `task` `factor` times, stopping early and silently if the
    /// iteration expires mid-burst.
    pub(crate) async fn enqueue(&self, iteration: &IterationDeadline, task: Arc<Task>) {
        for _ in 0..self.factor {
            tokio::select! {
                _ = iteration.expired() => return,
                res = self.tasks_tx.send(task.clone()) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn sample(&self) -> u32 {
        self.sample
    }

    pub(crate) async fn recurse(
        &self,
        iteration: &IterationDeadline,
        url: &Url,
    ) -> Result<(), LoaderError> {
        self.get(iteration, url).await
    }
}
