//! Redis broker
//!
//! Streams map to Redis Streams with consumer groups, per-session channels
//! to native pub/sub, session hashes to `HSET` + `PEXPIRE`. Non-blocking
//! commands go through a shared `ConnectionManager`; blocking `XREADGROUP`
//! reads use a dedicated connection so they cannot stall the multiplexed
//! pipeline.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use ::redis::AsyncCommands;

use crate::{Broker, BrokerError, Fields, PendingEntry, StreamEntry, Subscription};

/// Upper bound on entries returned by one pending/claim scan
const SCAN_COUNT: usize = 128;

/// Redis-backed broker
pub struct RedisBroker {
    client: ::redis::Client,
    manager: ConnectionManager,
    /// Lazily-created connection reserved for blocking reads
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Connect to the broker endpoint, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| BrokerError::Connection(format!("invalid broker url: {e}")))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            client,
            manager,
            blocking: Mutex::new(None),
        })
    }

    fn entries_from_read(reply: StreamReadReply) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = Fields::new();
                for (name, value) in id.map {
                    let text: String = ::redis::from_redis_value(&value)
                        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
                    fields.insert(name, text);
                }
                out.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(out)
    }

    fn is_busygroup(err: &::redis::RedisError) -> bool {
        err.code() == Some("BUSYGROUP")
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, BrokerError> {
        let mut conn = self.manager.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        // Read from the stream's beginning so entries appended before the
        // first worker came up are not skipped
        let result: Result<String, ::redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if Self::is_busygroup(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BrokerError::Connection(
                "blocking connection unavailable".to_string(),
            ));
        };

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: Result<StreamReadReply, ::redis::RedisError> =
            conn.xread_options(&[stream], &[">"], &options).await;

        match reply {
            Ok(reply) => Self::entries_from_read(reply),
            Err(err) => {
                // Force a reconnect on the next call
                *guard = None;
                Err(err.into())
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        // Acked entries are deleted so XLEN tracks live queue depth
        let _: i64 = conn.xdel(stream, &[id]).await?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.manager.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", SCAN_COUNT)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.manager.clone();
        let options = StreamAutoClaimOptions::default().count(SCAN_COUNT);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(stream, group, consumer, min_idle_ms as usize, "0-0", options)
            .await?;

        let mut out = Vec::new();
        for id in reply.claimed {
            let mut fields = Fields::new();
            for (name, value) in id.map {
                let text: String = ::redis::from_redis_value(&value)
                    .map_err(|e| BrokerError::Protocol(e.to_string()))?;
                fields.insert(name, text);
            }
            out.push(StreamEntry { id: id.id, fields });
        }
        Ok(out)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, BrokerError> {
        let mut conn = self.manager.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(channel = %channel, error = %err, "dropping undecodable message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Subscriber dropped; closing the task unsubscribes
                    break;
                }
            }
        });

        Ok(Subscription::from_channel(rx))
    }

    async fn session_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_ms: u64,
    ) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        let _: bool = conn.pexpire(key, ttl_ms as i64).await?;
        Ok(())
    }

    async fn session_get(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
        let mut conn = self.manager.clone();
        let map: Fields = conn.hgetall(key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn session_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
