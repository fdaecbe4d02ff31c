use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::http::AuthConfig;
use crate::limiter::Limiter;
use crate::task::{Task, TaskOutcome};

/// Runs one worker to completion. A worker owns its own `Client` (its own
/// connection pool) and holds at most one `Task` at a time, fetching a new
/// one from the shared queue whenever one is ready and otherwise reusing
/// its current task — so a slow-moving queue never starves a fast worker.
#[instrument(skip_all, fields(worker_id = id))]
pub async fn run(
    id: usize,
    client: Client,
    auth: AuthConfig,
    timeout: Duration,
    tasks_rx: Arc<Mutex<mpsc::Receiver<Arc<Task>>>>,
    limiter: Arc<Limiter>,
    results_tx: mpsc::Sender<TaskOutcome>,
    shutdown: CancellationToken,
) {
    let mut current = tasks_rx.lock().await.recv().await;
    let mut reused = false;

    while let Some(task) = current.clone() {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = deadline_race(reused, task.deadline) => {
                // Sat in the queue past its iteration's deadline: dropped,
                // no TaskOutcome emitted. Only raced on a freshly-dequeued
                // task -- once a task is being reused because the queue ran
                // dry, its original deadline is long past and no longer
                // bounds it, or this branch would win every future
                // iteration and the worker would stop issuing GETs for good.
            }
            token = limiter.acquire() => {
                if token.is_none() {
                    break;
                }
                let outcome = fetch(&client, &task, timeout, &auth).await;
                if results_tx.send(outcome).await.is_err() {
                    break;
                }
            }
        }

        let mut guard = tasks_rx.lock().await;
        if let Ok(next) = guard.try_recv() {
            current = Some(next);
            reused = false;
        } else {
            reused = true;
        }
        // else: keep reusing `current` (queue empty or closed).
    }
}

/// Races a freshly-dequeued task's deadline; a task already being reused
/// has none to race, so its branch never resolves.
async fn deadline_race(reused: bool, deadline: Instant) {
    if reused {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep_until(deadline.into()).await
    }
}

async fn fetch(client: &Client, task: &Task, timeout: Duration, auth: &AuthConfig) -> TaskOutcome {
    let req = auth.apply(client.get(task.url.clone()).timeout(timeout));
    match req.send().await {
        Ok(resp) => {
            let code = resp.status().as_u16();
            match resp.bytes().await {
                Ok(body) => TaskOutcome::response(code, body.len() as u64),
                Err(err) => {
                    warn!(url = %task.url, %err, "failed draining response body");
                    TaskOutcome::transport_error(err.to_string())
                }
            }
        }
        Err(err) => TaskOutcome::transport_error(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::limiter::Limiter;

    /// Hand-rolled loopback HTTP server: replies `200 ok` to anything sent
    /// its way. Good enough to exercise a worker without a mock-HTTP crate.
    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = conn.read(&mut buf).await;
                    let _ = conn
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });
        addr
    }

    /// spec.md §8 scenario 4: once the task channel is closed, a worker
    /// keeps reusing its current task instead of idling, so throughput
    /// doesn't collapse just because the producer fell behind.
    #[tokio::test]
    async fn worker_reuses_its_current_task_once_the_queue_is_closed() {
        let addr = spawn_echo_server().await;
        let url = url::Url::parse(&format!("http://{addr}/seg.ts")).unwrap();

        let (tasks_tx, tasks_rx) = mpsc::channel(1);
        let task = Arc::new(Task::new(url.clone(), Instant::now() + Duration::from_secs(30)));
        tasks_tx.send(task).await.unwrap();
        drop(tasks_tx); // closes the channel; worker must fall back to reuse

        let (results_tx, mut results_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let limiter = Arc::new(Limiter::Unlimited);

        let handle = tokio::spawn(run(
            0,
            crate::http::build_client(Duration::from_secs(5)).unwrap(),
            AuthConfig::none(),
            Duration::from_secs(5),
            Arc::new(Mutex::new(tasks_rx)),
            limiter,
            results_tx,
            shutdown.clone(),
        ));

        let mut seen = 0;
        for _ in 0..3 {
            let outcome = results_rx.recv().await.expect("worker kept producing results");
            assert_eq!(outcome.code, 200);
            seen += 1;
        }
        assert_eq!(seen, 3);

        shutdown.cancel();
        let _ = handle.await;
    }

    /// Regression test: a reused task's deadline, once passed, must not
    /// permanently win the `select!` race against `limiter.acquire()`. The
    /// deadline here elapses almost immediately, well before the queue
    /// closes, so a worker that re-raced it on every reused iteration would
    /// stop producing results after the first drop.
    #[tokio::test]
    async fn worker_keeps_fetching_a_reused_task_after_its_deadline_has_passed() {
        let addr = spawn_echo_server().await;
        let url = url::Url::parse(&format!("http://{addr}/seg.ts")).unwrap();

        let (tasks_tx, tasks_rx) = mpsc::channel(1);
        let task = Arc::new(Task::new(url.clone(), Instant::now() + Duration::from_millis(20)));
        tasks_tx.send(task).await.unwrap();
        drop(tasks_tx);

        let (results_tx, mut results_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let limiter = Arc::new(Limiter::Unlimited);

        let handle = tokio::spawn(run(
            0,
            crate::http::build_client(Duration::from_secs(5)).unwrap(),
            AuthConfig::none(),
            Duration::from_secs(5),
            Arc::new(Mutex::new(tasks_rx)),
            limiter,
            results_tx,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut seen = 0;
        for _ in 0..5 {
            let outcome = results_rx.recv().await.expect("worker kept producing results past the deadline");
            assert_eq!(outcome.code, 200);
            seen += 1;
        }
        assert_eq!(seen, 5);

        shutdown.cancel();
        let _ = handle.await;
    }
}
