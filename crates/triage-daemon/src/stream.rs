//! Redis Streams client for the ingest stream.
//!
//! One durable stream, one consumer group shared by all workers. Entries
//! are delivered to exactly one group member and sit in the pending set
//! until acked; a periodic sweep force-acks entries whose consumer died
//! mid-processing so one crash cannot wedge the group.

use crate::config::Settings;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PENDING_SCAN_COUNT: usize = 100;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        StreamError::Broker(err.to_string())
    }
}

/// One entry read from the stream. Producers publish two string fields,
/// `type` and `data`; both are optional here so malformed entries still
/// reach the consumer (which logs and acks them).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub kind: Option<String>,
    pub data: Option<String>,
}

/// The stream operations the consumer loop needs. Implemented by the Redis
/// client in production and by scripted stubs in tests.
#[async_trait]
pub trait EventStream: Send {
    /// Read up to `max_batch` new entries for this consumer, blocking up to
    /// `block` when the stream is empty. Broker connection loss yields an
    /// empty batch, not an error.
    async fn read(
        &mut self,
        max_batch: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Retire an entry from the group's pending set. Failures are logged
    /// and swallowed; the reclaim sweep covers anything missed. Repeated
    /// acks of the same id are harmless.
    async fn ack(&mut self, id: &str);

    /// Force-ack pending entries idle longer than `idle`. Returns how many
    /// entries were reclaimed.
    async fn reclaim_stale(&mut self, idle: Duration) -> u64;
}

/// Redis implementation over a managed connection.
pub struct RedisStream {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisStream {
    /// Connect and ensure the stream and consumer group exist. Racing with
    /// a peer on group creation is expected: `BUSYGROUP` is not an error.
    pub async fn connect(settings: &Settings) -> Result<Self, StreamError> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StreamError::ConnectTimeout(CONNECT_TIMEOUT))??;

        let stream = Self {
            conn,
            stream: settings.redis_stream.clone(),
            group: settings.redis_group.clone(),
            consumer: settings.consumer_name.clone(),
        };

        let mut conn = stream.conn.clone();
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&stream.stream, &stream.group, "0")
            .await;
        match created {
            Ok(_) => {
                tracing::info!(
                    stream = %stream.stream,
                    group = %stream.group,
                    "created consumer group"
                );
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(group = %stream.group, "consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(stream)
    }

    fn is_connection_loss(err: &redis::RedisError) -> bool {
        err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
    }
}

#[async_trait]
impl EventStream for RedisStream {
    async fn read(
        &mut self,
        max_batch: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max_batch)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        // A blocked read that times out answers nil, hence the Option.
        let reply: Result<Option<StreamReadReply>, redis::RedisError> = conn
            .xread_options(&[self.stream.as_str()], &[">"], &options)
            .await;

        match reply {
            Ok(reply) => {
                let reply = reply.unwrap_or_default();
                let mut entries = Vec::new();
                for key in reply.keys {
                    for id in key.ids {
                        let kind = id
                            .map
                            .get("type")
                            .and_then(|v| redis::from_redis_value::<String>(v).ok());
                        let data = id
                            .map
                            .get("data")
                            .and_then(|v| redis::from_redis_value::<String>(v).ok());
                        entries.push(StreamEntry {
                            id: id.id,
                            kind,
                            data,
                        });
                    }
                }
                Ok(entries)
            }
            Err(e) if Self::is_connection_loss(&e) => {
                tracing::error!(error = %e, "stream connection lost during read");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ack(&mut self, id: &str) {
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> =
            conn.xack(&self.stream, &self.group, &[id]).await;
        if let Err(e) = result {
            tracing::error!(entry_id = %id, error = %e, "failed to ack stream entry");
        }
    }

    async fn reclaim_stale(&mut self, idle: Duration) -> u64 {
        let mut conn = self.conn.clone();
        let pending: Result<StreamPendingCountReply, redis::RedisError> = conn
            .xpending_count(&self.stream, &self.group, "-", "+", PENDING_SCAN_COUNT)
            .await;

        let pending = match pending {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan pending entries");
                return 0;
            }
        };

        let idle_ms = idle.as_millis() as usize;
        let mut reclaimed = 0;
        for entry in pending.ids {
            if entry.last_delivered_ms <= idle_ms {
                continue;
            }
            tracing::warn!(
                entry_id = %entry.id,
                idle_ms = entry.last_delivered_ms,
                consumer = %entry.consumer,
                "reclaiming stuck pending entry"
            );
            let result: Result<i64, redis::RedisError> =
                conn.xack(&self.stream, &self.group, &[&entry.id]).await;
            match result {
                Ok(_) => reclaimed += 1,
                Err(e) => {
                    tracing::error!(entry_id = %entry.id, error = %e, "failed to reclaim entry")
                }
            }
        }

        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "reclaimed stuck pending entries");
        }
        reclaimed
    }
}
