//! Fan-out request racing
//!
//! One probe task per candidate endpoint, all reporting into a single
//! channel. The caller consumes results as they land and stops at the first
//! decisive one; dropping the [`Fanout`] aborts probes that are still in
//! flight, so a fan-out never outlives its caller's deadline.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Outcome of a single probe.
pub struct ProbeResult<T> {
    /// Endpoint the probe targeted
    pub url: String,
    /// Wall time the probe took
    pub elapsed: Duration,
    /// What the endpoint answered
    pub outcome: Result<T>,
}

/// A group of racing probes.
pub struct Fanout<T> {
    rx: mpsc::Receiver<ProbeResult<T>>,
    _tasks: JoinSet<()>,
    total: usize,
    received: usize,
}

impl<T: Send + 'static> Fanout<T> {
    /// Spawn one probe per target.
    ///
    /// `probe` builds the request future for one endpoint; each future runs
    /// in its own task and reports exactly once.
    pub fn spawn<F, Fut>(targets: Vec<String>, probe: F) -> Self
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = targets.len();
        let (tx, rx) = mpsc::channel(total.max(1));
        let mut tasks = JoinSet::new();

        for url in targets {
            let fut = probe(url.clone());
            let tx = tx.clone();
            tasks.spawn(async move {
                let begin = Instant::now();
                let outcome = fut.await;
                let _ = tx
                    .send(ProbeResult {
                        url,
                        elapsed: begin.elapsed(),
                        outcome,
                    })
                    .await;
            });
        }
        drop(tx);

        Self {
            rx,
            _tasks: tasks,
            total,
            received: 0,
        }
    }

    /// Next finished probe; `None` once every probe has reported.
    pub async fn recv(&mut self) -> Option<ProbeResult<T>> {
        let result = self.rx.recv().await;
        if result.is_some() {
            self.received += 1;
        }
        result
    }

    /// Number of probes still outstanding.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total - self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_fastest_probe_arrives_first() {
        let mut fanout = Fanout::spawn(
            vec!["slow".to_string(), "fast".to_string()],
            |url| async move {
                if url == "slow" {
                    sleep(Duration::from_millis(80)).await;
                } else {
                    sleep(Duration::from_millis(5)).await;
                }
                Ok(url)
            },
        );

        let first = fanout.recv().await.unwrap();
        assert_eq!(first.url, "fast");
        assert_eq!(fanout.remaining(), 1);

        let second = fanout.recv().await.unwrap();
        assert_eq!(second.url, "slow");
        assert!(second.elapsed >= Duration::from_millis(80));
        assert_eq!(fanout.remaining(), 0);
        assert!(fanout.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_reported_not_swallowed() {
        let mut fanout = Fanout::spawn(vec!["bad".to_string()], |_| async move {
            Err::<(), _>(Error::Timeout)
        });

        let probe = fanout.recv().await.unwrap();
        assert!(matches!(probe.outcome, Err(Error::Timeout)));
        assert!(fanout.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let mut fanout = Fanout::spawn(Vec::new(), |url| async move { Ok(url) });
        assert!(fanout.recv().await.is_none());
    }
}
