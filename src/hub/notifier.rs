//! Background delivery of publish notifications to the hub.

use super::client::HubClient;
use super::queue::{NotifyQueue, NotifyTask};
use crate::error::{FeedError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// First retry delay; doubles per failed attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Cap on the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How long the worker sleeps when nothing is queued.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
struct Retry {
    attempts: u32,
    not_before: Instant,
}

/// What one delivery pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Rejected by the hub for good; removed from the queue.
    pub dropped: usize,
    /// Failed and scheduled for another attempt.
    pub retrying: usize,
    /// Time until the earliest scheduled retry.
    pub next_due: Option<Duration>,
}

/// Sends `hub.mode=publish` notifications for changed feeds.
///
/// `notify` only records the intent durably; a worker (`run`) delivers in
/// the background so a slow or unreachable hub never holds up a writer.
pub struct HubNotifier {
    hub_url: String,
    client: Arc<dyn HubClient>,
    queue: NotifyQueue,
    retries: Mutex<HashMap<u64, Retry>>,
    wake: Notify,
}

impl HubNotifier {
    pub fn new(hub_url: impl Into<String>, client: Arc<dyn HubClient>, queue: NotifyQueue) -> Self {
        Self {
            hub_url: hub_url.into(),
            client,
            queue,
            retries: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    /// Record that `feed_uri` has new content and wake the worker.
    pub fn notify(&self, feed_uri: &str) -> Result<()> {
        let seq = self.queue.enqueue(feed_uri)?;
        tracing::debug!(feed_uri, seq, "queued hub notification");
        self.wake.notify_one();
        Ok(())
    }

    /// Number of notifications not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Attempt every task that is due.
    pub async fn deliver_pending(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for task in self.queue.pending() {
            let now = Instant::now();
            if let Some(retry) = self.retries.lock().get(&task.seq) {
                if retry.not_before > now {
                    report.retrying += 1;
                    continue;
                }
            }

            if !self.queue.begin(task.seq) {
                continue;
            }

            match self.deliver(&task).await {
                Ok(()) => {
                    self.finish(task.seq);
                    report.delivered += 1;
                }
                Err(e) if is_permanent(&e) => {
                    tracing::warn!(feed_uri = %task.feed_uri, error = %e, "hub rejected notification; dropping");
                    self.finish(task.seq);
                    report.dropped += 1;
                }
                Err(e) => {
                    self.queue.release(task.seq);
                    let retry = self.schedule_retry(task.seq);
                    tracing::warn!(
                        feed_uri = %task.feed_uri,
                        attempt = retry.attempts,
                        error = %e,
                        "hub notification failed; will retry"
                    );
                    report.retrying += 1;
                }
            }
        }

        let now = Instant::now();
        report.next_due = self
            .retries
            .lock()
            .values()
            .map(|r| r.not_before.saturating_duration_since(now))
            .min();
        report
    }

    /// Deliver until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        tracing::info!(hub = %self.hub_url, "hub notifier started");

        loop {
            let report = self.deliver_pending().await;
            if report.delivered > 0 || report.dropped > 0 {
                tracing::debug!(
                    delivered = report.delivered,
                    dropped = report.dropped,
                    retrying = report.retrying,
                    "hub delivery pass"
                );
            }

            let wait = report.next_due.unwrap_or(IDLE_WAIT);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(pending = self.queue.len(), "hub notifier stopped");
    }

    async fn deliver(&self, task: &NotifyTask) -> Result<()> {
        let params = [("hub.mode", "publish"), ("hub.url", task.feed_uri.as_str())];
        let status = self.client.post_form(&self.hub_url, &params).await?;
        if (200..300).contains(&status) {
            tracing::info!(feed_uri = %task.feed_uri, status, "notified hub");
            Ok(())
        } else {
            Err(FeedError::HubRejected(status))
        }
    }

    fn finish(&self, seq: u64) {
        self.retries.lock().remove(&seq);
        if let Err(e) = self.queue.complete(seq) {
            tracing::error!(seq, error = %e, "failed to mark notification complete");
        }
    }

    fn schedule_retry(&self, seq: u64) -> Retry {
        let mut retries = self.retries.lock();
        let attempts = retries.get(&seq).map_or(1, |r| r.attempts + 1);
        let retry = Retry {
            attempts,
            not_before: Instant::now() + backoff(attempts),
        };
        retries.insert(seq, retry);
        retry
    }
}

/// Delay before retry number `attempts` (1-based).
pub fn backoff(attempts: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempts.saturating_sub(1))
        .unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// 4xx other than 429 will not succeed on retry.
fn is_permanent(error: &FeedError) -> bool {
    matches!(error, FeedError::HubRejected(status) if (400..500).contains(status) && *status != 429)
}
