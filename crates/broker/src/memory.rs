//! In-process broker
//!
//! Backs tests and single-node deployments. Same delivery semantics as the
//! Redis backend: consumer groups hand each entry to exactly one consumer,
//! unacked entries stay pending until acked or claimed, acked entries are
//! trimmed so `stream_len` tracks live depth.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{Broker, BrokerError, Fields, PendingEntry, StreamEntry, Subscription};

/// How often a blocked consume re-checks the stream
const CONSUME_POLL: Duration = Duration::from_millis(10);

struct PendingState {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Entries with id >= cursor have not been delivered to this group
    cursor: u64,
    pending: HashMap<u64, PendingState>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    entries: VecDeque<(u64, Fields)>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Drop an entry once no group still references it
    fn trim(&mut self, id: u64) {
        let referenced = self
            .groups
            .values()
            .any(|g| g.cursor <= id || g.pending.contains_key(&id));
        if !referenced {
            self.entries.retain(|(eid, _)| *eid != id);
        }
    }
}

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    hashes: Mutex<HashMap<String, (Fields, Instant)>>,
}

/// In-memory broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_id(id: &str) -> Result<u64, BrokerError> {
        id.split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| BrokerError::Protocol(format!("bad entry id {id}")))
    }

    fn format_id(id: u64) -> String {
        format!("{id}-0")
    }

    fn try_consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut streams = self.inner.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;

        // Split borrow: find the group's cursor first
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut batch = Vec::new();
        for (id, fields) in state.entries.iter() {
            if *id < group_state.cursor {
                continue;
            }
            batch.push(StreamEntry {
                id: Self::format_id(*id),
                fields: fields.clone(),
            });
            group_state.pending.insert(
                *id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                },
            );
            group_state.cursor = *id + 1;
            if batch.len() >= count {
                break;
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, BrokerError> {
        let mut streams = self.inner.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let id = state.next_id;
        state.next_id += 1;
        state
            .entries
            .push_back((id, fields.iter().cloned().collect()));
        Ok(Self::format_id(id))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut streams = self.inner.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);

        loop {
            let batch = self.try_consume(stream, group, consumer, count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(CONSUME_POLL).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let id = Self::parse_id(id)?;
        let mut streams = self.inner.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.pending.remove(&id);
        }
        state.trim(id);
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let streams = self.inner.streams.lock();
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let now = Instant::now();
        let mut list: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: Self::format_id(*id),
                consumer: p.consumer.clone(),
                idle_ms: now.duration_since(p.delivered_at).as_millis() as u64,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut streams = self.inner.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;

        let entries_snapshot: HashMap<u64, Fields> = state.entries.iter().cloned().collect();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let now = Instant::now();
        let min_idle = Duration::from_millis(min_idle_ms);
        let mut claimed = Vec::new();

        let mut ids: Vec<u64> = group_state.pending.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(&id) else {
                continue;
            };
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = entries_snapshot.get(&id) else {
                // Entry was trimmed; nothing left to reprocess
                group_state.pending.remove(&id);
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            claimed.push(StreamEntry {
                id: Self::format_id(id),
                fields: fields.clone(),
            });
        }

        Ok(claimed)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, BrokerError> {
        let streams = self.inner.streams.lock();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        let channels = self.inner.channels.lock();
        if let Some(sender) = channels.get(channel) {
            // No subscribers is not an error
            let _ = sender.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut channels = self.inner.channels.lock();
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0);
        Ok(Subscription::from_broadcast(sender.subscribe()))
    }

    async fn session_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<(), BrokerError> {
        let expires = Instant::now() + Duration::from_millis(ttl_ms);
        self.inner
            .hashes
            .lock()
            .insert(key.to_string(), (fields.iter().cloned().collect(), expires));
        Ok(())
    }

    async fn session_get(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
        let mut hashes = self.inner.hashes.lock();
        match hashes.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                hashes.remove(key);
                Ok(None)
            }
            Some((fields, _)) => Ok(Some(fields.clone())),
            None => Ok(None),
        }
    }

    async fn session_delete(&self, key: &str) -> Result<(), BrokerError> {
        self.inner.hashes.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_append_consume_ack() {
        let broker = MemoryBroker::new();
        broker.ensure_group("jobs", "g").await.unwrap();
        broker
            .append("jobs", &fields(&[("k", "v1")]))
            .await
            .unwrap();
        broker
            .append("jobs", &fields(&[("k", "v2")]))
            .await
            .unwrap();

        let batch = broker.consume("jobs", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].fields["k"], "v1");

        assert_eq!(broker.stream_len("jobs").await.unwrap(), 2);
        broker.ack("jobs", "g", &batch[0].id).await.unwrap();
        assert_eq!(broker.stream_len("jobs").await.unwrap(), 1);
        broker.ack("jobs", "g", &batch[1].id).await.unwrap();
        assert_eq!(broker.stream_len("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_each_entry_goes_to_one_consumer() {
        let broker = MemoryBroker::new();
        broker.ensure_group("jobs", "g").await.unwrap();
        for i in 0..4 {
            broker
                .append("jobs", &fields(&[("i", &i.to_string())]))
                .await
                .unwrap();
        }

        let a = broker.consume("jobs", "g", "a", 2, 0).await.unwrap();
        let b = broker.consume("jobs", "g", "b", 10, 0).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        let mut ids: Vec<&str> = a.iter().chain(b.iter()).map(|e| e.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_reassigns_idle_entries() {
        let broker = MemoryBroker::new();
        broker.ensure_group("jobs", "g").await.unwrap();
        broker.append("jobs", &fields(&[("k", "v")])).await.unwrap();

        let batch = broker.consume("jobs", "g", "dead", 1, 0).await.unwrap();
        assert_eq!(batch.len(), 1);

        // Not idle long enough yet
        let claimed = broker.claim("jobs", "g", "alive", 5000).await.unwrap();
        assert!(claimed.is_empty());

        tokio::time::advance(Duration::from_millis(6000)).await;

        let claimed = broker.claim("jobs", "g", "alive", 5000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].fields["k"], "v");

        let pending = broker.pending("jobs", "g").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "alive");
    }

    #[tokio::test]
    async fn test_blocking_consume_sees_late_append() {
        let broker = MemoryBroker::new();
        broker.ensure_group("jobs", "g").await.unwrap();

        let consumer = broker.clone();
        let handle =
            tokio::spawn(async move { consumer.consume("jobs", "g", "c", 1, 1000).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.append("jobs", &fields(&[("k", "v")])).await.unwrap();

        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_pubsub_delivers() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("results:s1").await.unwrap();
        broker.publish("results:s1", "hello").await.unwrap();
        assert_eq!(sub.next().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        broker.publish("results:void", "msg").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_hash_ttl() {
        let broker = MemoryBroker::new();
        broker
            .session_set("session:s1", &fields(&[("lang", "en")]), 1000)
            .await
            .unwrap();

        let read = broker.session_get("session:s1").await.unwrap().unwrap();
        assert_eq!(read["lang"], "en");

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(broker.session_get("session:s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_unknown_group_fails() {
        let broker = MemoryBroker::new();
        broker.append("jobs", &fields(&[("k", "v")])).await.unwrap();
        assert!(broker.consume("jobs", "nope", "c", 1, 0).await.is_err());
    }
}
