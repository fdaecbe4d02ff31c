use std::time::Instant;

use url::Url;

/// A single segment fetch, queued once per (segment, `factor` repeat).
///
/// Cheap to clone via `Arc` so the loader can resend the same task `factor`
/// times and a worker can reuse its current task when the queue is empty
/// without re-parsing a URL.
#[derive(Debug)]
pub struct Task {
    pub url: Url,
    /// Wall-clock deadline of the playlist iteration this task was queued
    /// from. A task still sitting in the queue past this instant is
    /// discarded without producing a `TaskOutcome`.
    pub deadline: Instant,
}

impl Task {
    pub fn new(url: Url, deadline: Instant) -> Self {
        Self { url, deadline }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// The outcome of a single GET, as reported by a worker to the stats
/// collector. `err` carries a transport-level failure message (connection
/// refused, timeout, TLS error, ...); a non-2xx HTTP response is *not* an
/// `err` — it is recorded in `code` and it still counts as hitting the
/// endpoint.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub err: Option<String>,
    pub code: u16,
    pub size: u64,
}

impl TaskOutcome {
    pub fn transport_error(message: String) -> Self {
        Self { err: Some(message), code: 0, size: 0 }
    }

    pub fn response(code: u16, size: u64) -> Self {
        Self { err: None, code, size }
    }
}
