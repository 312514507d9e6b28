//! Broker abstraction
//!
//! The three primitives every service shares:
//! - append-only streams with consumer groups (`audio_jobs`,
//!   `final_transcripts`): at-least-once delivery, explicit ack, idle
//!   entries reclaimable by another consumer
//! - per-session pub/sub channels (`results:{session_id}`), no persistence
//! - session hashes (`session:{session_id}`) with a TTL
//!
//! Backends: `MemoryBroker` for tests and single-node runs, `RedisBroker`
//! for production. Callers wrap transient failures in [`with_backoff`].

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Flat string map, the shape stream entries and hashes travel in
pub type Fields = HashMap<String, String>;

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("unknown group {group} on stream {stream}")]
    UnknownGroup { stream: String, group: String },

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Protocol(err.to_string())
        }
    }
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Broker-assigned entry id
    pub id: String,
    pub fields: Fields,
}

/// One unacknowledged entry, as reported by `pending`
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer the entry is currently assigned to
    pub consumer: String,
    /// Milliseconds since last delivery
    pub idle_ms: u64,
}

/// A live pub/sub subscription.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    inner: SubscriptionInner,
}

enum SubscriptionInner {
    Broadcast(tokio::sync::broadcast::Receiver<String>),
    Channel(tokio::sync::mpsc::Receiver<String>),
}

impl Subscription {
    pub(crate) fn from_broadcast(rx: tokio::sync::broadcast::Receiver<String>) -> Self {
        Self {
            inner: SubscriptionInner::Broadcast(rx),
        }
    }

    pub(crate) fn from_channel(rx: tokio::sync::mpsc::Receiver<String>) -> Self {
        Self {
            inner: SubscriptionInner::Channel(rx),
        }
    }

    /// Next message, or `None` once the channel is gone
    pub async fn next(&mut self) -> Option<String> {
        match &mut self.inner {
            SubscriptionInner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(msg) => return Some(msg),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Stale results are dropped by the router anyway
                        tracing::warn!(skipped = n, "subscription lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            },
            SubscriptionInner::Channel(rx) => rx.recv().await,
        }
    }
}

/// Broker interface
///
/// All operations fail loudly; transient errors are retried by the caller.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Append an entry to a stream, returning the assigned id
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, BrokerError>;

    /// Create a consumer group if it does not exist yet.
    ///
    /// Idempotent; groups read the stream from its beginning.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Read up to `count` new entries for `consumer`, blocking up to
    /// `block_ms` when the stream is drained.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge a delivered entry
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// List unacknowledged entries for a group
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Take over entries idle for at least `min_idle_ms`, reassigning them
    /// to `consumer` and returning them for reprocessing.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Current depth of a stream (live, unacknowledged entries included)
    async fn stream_len(&self, stream: &str) -> Result<u64, BrokerError>;

    /// Publish a message on a channel; no-op if nobody listens
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;

    /// Write a session hash, refreshing its TTL
    async fn session_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<(), BrokerError>;

    /// Read a session hash, `None` if missing or expired
    async fn session_get(&self, key: &str) -> Result<Option<Fields>, BrokerError>;

    /// Drop a session hash
    async fn session_delete(&self, key: &str) -> Result<(), BrokerError>;

    /// Liveness probe for readiness endpoints
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Retry an operation with bounded exponential backoff and jitter.
///
/// Gives up once the next attempt would overrun `deadline` and returns the
/// last error.
pub async fn with_backoff<T, F, Fut>(
    deadline: Duration,
    op: &str,
    mut f: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    use rand::Rng;

    let start = tokio::time::Instant::now();
    let mut delay = Duration::from_millis(50);

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2),
                );
                let next_delay = delay + jitter;
                if start.elapsed() + next_delay >= deadline {
                    tracing::error!(op, error = %err, "retries exhausted");
                    return Err(err);
                }
                tracing::warn!(op, error = %err, retry_in_ms = next_delay.as_millis() as u64, "transient broker error");
                tokio::time::sleep(next_delay).await;
                delay = (delay * 2).min(Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_backoff_succeeds_after_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_backoff(Duration::from_secs(5), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Connection("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_at_deadline() {
        let result: Result<(), _> = with_backoff(Duration::from_millis(10), "test", || async {
            Err(BrokerError::Connection("down".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
