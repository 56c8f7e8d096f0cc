//! Notification fanout.
//!
//! Each job has a list of subscriber channels. An event is serialized once
//! and written to every subscriber of its job concurrently; a subscriber
//! whose write fails, or blocks for longer than the write timeout, is
//! dropped without affecting the others. The list lock is only held to
//! snapshot or edit the lists, never across a write.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use procgov_common::constants::DEFAULT_NOTIFY_TIMEOUT_MS;
use procgov_ipc::codec::encode_message;
use procgov_ipc::protocol::Notification;
use tokio::io::{AsyncWrite, AsyncWriteExt};

type Writer = Pin<Box<dyn AsyncWrite + Send>>;

struct Subscriber {
    id: u64,
    writer: tokio::sync::Mutex<Writer>,
}

impl Subscriber {
    async fn send(&self, bytes: &[u8], timeout: Duration) -> std::io::Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
    }
}

/// Per-job subscriber lists.
pub struct Notifier {
    subscribers: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            subscribers: Mutex::default(),
            next_id: AtomicU64::new(0),
            write_timeout: Duration::from_millis(DEFAULT_NOTIFY_TIMEOUT_MS),
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock();
        f.debug_struct("Notifier")
            .field("jobs", &subscribers.len())
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Creates a notifier without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a write to one subscriber may block.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Adds a subscriber to `job`. Returns its id.
    pub fn subscribe<W>(&self, job: &str, writer: W) -> u64
    where
        W: AsyncWrite + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            writer: tokio::sync::Mutex::new(Box::pin(writer)),
        });
        self.subscribers
            .lock()
            .entry(job.to_owned())
            .or_default()
            .push(subscriber);
        tracing::debug!(job, subscriber = id, "subscriber added");
        id
    }

    /// Number of subscribers of `job`.
    #[must_use]
    pub fn subscriber_count(&self, job: &str) -> usize {
        self.subscribers.lock().get(job).map_or(0, Vec::len)
    }

    /// Delivers an event to every subscriber of its job.
    ///
    /// After the terminal event all subscribers of the job are released.
    pub async fn notify(&self, event: &Notification) {
        let job = event.job_name();
        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .lock()
            .get(job)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            if event.is_terminal() {
                let _ = self.subscribers.lock().remove(job);
            }
            return;
        }

        let bytes = match encode_message(event) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(job, error = %e, "failed to serialize notification");
                return;
            }
        };
        let results = join_all(targets.iter().map(|s| s.send(&bytes, self.write_timeout))).await;
        let failed: Vec<u64> = targets
            .iter()
            .zip(results)
            .filter_map(|(subscriber, result)| {
                result.err().map(|e| {
                    tracing::debug!(job, subscriber = subscriber.id, error = %e, "dropping subscriber");
                    subscriber.id
                })
            })
            .collect();

        let released = {
            let mut subscribers = self.subscribers.lock();
            if event.is_terminal() {
                subscribers.remove(job).unwrap_or_default()
            } else {
                if let Some(list) = subscribers.get_mut(job) {
                    list.retain(|s| !failed.contains(&s.id));
                    if list.is_empty() {
                        let _ = subscribers.remove(job);
                    }
                }
                Vec::new()
            }
        };
        if !released.is_empty() {
            tracing::debug!(job, count = released.len(), "subscribers released after terminal event");
        }
        close_all(released).await;
    }

    /// Releases every subscriber, shutting down their channels.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Subscriber>> = self
            .subscribers
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        close_all(all).await;
    }
}

async fn close_all(subscribers: Vec<Arc<Subscriber>>) {
    let closes = subscribers.iter().map(|subscriber| async move {
        let _ = subscriber.writer.lock().await.shutdown().await;
    });
    let _ = join_all(closes).await;
}
