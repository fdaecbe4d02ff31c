use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::progress::ProgressTracker;

/// One supervised transcoder subprocess, its progress-listening socket and
/// the tasks watching both. Lifecycle: *launching → listening → running →
/// stopped*.
pub struct Job {
    pub name: String,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Job {
    /// Spawns `cmd -v warning -progress unix://<dir>/<name>.sock <forwarded>`,
    /// binds its progress socket, and starts the three supervising tasks:
    /// accept-and-read, child-wait, and cancellation-triggered SIGTERM.
    ///
    /// `notify` is the shared, coalescing stall channel; the job sends into
    /// it (non-blocking) whenever it ends for a reason the job itself
    /// discovered rather than one the caller requested via [`Job::stop`].
    pub async fn launch(
        name: String,
        dir: &std::path::Path,
        cmd: &str,
        forwarded_args: &[String],
        notify: mpsc::Sender<()>,
        parent: &CancellationToken,
    ) -> Result<Self, JobError> {
        let socket_path = dir.join(format!("{name}.sock"));
        let listener = UnixListener::bind(&socket_path).map_err(|source| JobError::SocketListen {
            path: socket_path.display().to_string(),
            source,
        })?;

        let mut command = process_utils::tokio_command(cmd);
        command
            .arg("-v")
            .arg("warning")
            .arg("-progress")
            .arg(format!("unix://{}", socket_path.display()))
            .args(forwarded_args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let pid = child.id();

        let cancel = parent.child_token();

        let mut handles = Vec::with_capacity(3);

        handles.push(tokio::spawn(accept_and_read(
            name.clone(),
            listener,
            socket_path.clone(),
            cancel.clone(),
            notify.clone(),
        )));

        handles.push(tokio::spawn({
            let name = name.clone();
            let cancel = cancel.clone();
            let notify = notify.clone();
            async move {
                let status = child.wait().await;
                debug!(job = %name, ?status, "child process exited");
                if !cancel.is_cancelled() {
                    cancel.cancel();
                    let _ = notify.try_send(());
                }
            }
        }));

        handles.push(tokio::spawn({
            let name = name.clone();
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                if let Some(pid) = pid {
                    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        Ok(()) => debug!(job = %name, pid, "sent SIGTERM"),
                        Err(err) => warn!(job = %name, pid, %err, "failed to signal process"),
                    }
                }
            }
        }));

        Ok(Self { name, cancel, handles: Mutex::new(handles) })
    }

    /// Cancels the job, sends SIGTERM and waits for every supervising task
    /// to exit. Idempotent: a second call synchronises with the first
    /// (and with the reader task) rather than returning early.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut guard = self.handles.lock().await;
        for handle in std::mem::take(&mut *guard) {
            let _ = handle.await;
        }
    }
}

/// Accepts the transcoder's single connection to the progress socket and
/// reads `-progress` records from it in 2 KiB chunks until the job is
/// cancelled, the connection closes, or a stall is declared. Socket
/// cleanup (`unlink`) always runs before this task returns.
async fn accept_and_read(
    name: String,
    listener: UnixListener,
    socket_path: PathBuf,
    cancel: CancellationToken,
    notify: mpsc::Sender<()>,
) {
    let conn = tokio::select! {
        _ = cancel.cancelled() => None,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => Some(stream),
            Err(err) => {
                warn!(job = %name, %err, "accept failed");
                None
            }
        },
    };

    if let Some(mut conn) = conn {
        let mut tracker = ProgressTracker::new();
        let mut buf = [0u8; 2048];
        let ended_cleanly = 'reader: loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break 'reader true,
                res = conn.read(&mut buf) => res,
            };
            let n = match read {
                Ok(0) => break 'reader false,
                Ok(n) => n,
                Err(err) => {
                    warn!(job = %name, %err, "progress socket read failed");
                    break 'reader false;
                }
            };
            let chunk = String::from_utf8_lossy(&buf[..n]);
            if let Err(err) = tracker.ingest(&chunk) {
                warn!(job = %name, %err, "malformed progress record, stopping job");
                break 'reader false;
            }
            if tracker.update_stall_count() {
                info!(job = %name, "stall detected");
                break 'reader false;
            }
        };

        if !ended_cleanly && !cancel.is_cancelled() {
            cancel.cancel();
            let _ = notify.try_send(());
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    /// Scenario 5: a command that exits immediately never writes a single
    /// progress record, so the child-wait task's EOF path is what tells
    /// the Runner this job failed to hold.
    #[tokio::test]
    async fn a_command_that_exits_immediately_notifies_a_stall() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let job = Job::launch(
            "ffmpeg-test".to_string(),
            dir.path(),
            "true",
            &[],
            tx,
            &shutdown,
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notify fired")
            .expect("channel open");

        job.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_synchronises_with_the_reader() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let job = Job::launch("ffmpeg-test2".to_string(), dir.path(), "sleep", &["5".to_string()], tx, &shutdown)
            .await
            .unwrap();

        job.stop().await;
        job.stop().await;
        assert!(!dir.path().join("ffmpeg-test2.sock").exists());
    }
}
