//! Redis Streams backend for the bus client.
//!
//! Thin mapping of the [`StreamBus`](super::StreamBus) trait onto
//! XADD / XGROUP CREATE MKSTREAM / XREADGROUP / XACK, with stale-pending
//! reclaim through XPENDING + XCLAIM, all over a reconnecting
//! `ConnectionManager`. Connectivity is tracked from command outcomes; the
//! client above decides what degraded mode means.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};

use super::{Fields, MessageId, StreamBus};
use crate::config::BusConfig;

pub struct RedisBus {
    manager: ConnectionManager,
    command_timeout: Duration,
    connected: AtomicBool,
}

impl RedisBus {
    /// Connects to the configured Redis instance.
    pub async fn connect(cfg: &BusConfig) -> anyhow::Result<Self> {
        let url = match &cfg.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, cfg.host, cfg.port, cfg.db)
            }
            None => format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db),
        };
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(
            Duration::from_millis(cfg.connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("redis connect timed out"))??;

        Ok(Self {
            manager,
            command_timeout: Duration::from_millis(cfg.command_timeout_ms.max(1)),
            connected: AtomicBool::new(true),
        })
    }

    async fn run<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let result = tokio::time::timeout(self.command_timeout, op).await;
        match result {
            Ok(Ok(value)) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e.into())
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(anyhow::anyhow!("redis command timed out"))
            }
        }
    }
}

#[async_trait]
impl StreamBus for RedisBus {
    async fn publish(&self, stream: &str, fields: &Fields) -> anyhow::Result<MessageId> {
        let pairs: Vec<(String, String)> =
            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut conn = self.manager.clone();
        let id: String = self
            .run(async move { conn.xadd(stream, "*", &pairs).await })
            .await?;
        Ok(MessageId(id))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let result: redis::RedisResult<String> = tokio::time::timeout(
            self.command_timeout,
            conn.xgroup_create_mkstream(stream, group, "$"),
        )
        .await
        .map_err(|_| anyhow::anyhow!("redis command timed out"))?;

        match result {
            Ok(_) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            // An existing group is success.
            Err(e) if e.code() == Some("BUSYGROUP") => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(batch.max(1))
            .block(block.as_millis() as usize);

        let mut conn = self.manager.clone();
        let deadline = self.command_timeout + block;
        let result = tokio::time::timeout(deadline, async move {
            conn.xread_options::<_, _, StreamReadReply>(&[stream], &[">"], &options)
                .await
        })
        .await;

        let reply = match result {
            Ok(Ok(reply)) => {
                self.connected.store(true, Ordering::SeqCst);
                reply
            }
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                return Err(e.into());
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(anyhow::anyhow!("redis read timed out"));
            }
        };

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = Fields::new();
                for (name, value) in entry.map {
                    match redis::from_redis_value::<String>(&value) {
                        Ok(text) => {
                            fields.insert(name, text);
                        }
                        Err(_) => {
                            tracing::warn!(stream, field = %name, "non-string stream field skipped");
                        }
                    }
                }
                out.push((MessageId(entry.id), fields));
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let id = id.0.clone();
        let _: u64 = self
            .run(async move { conn.xack(stream, group, &[id]).await })
            .await?;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>> {
        let min_idle_ms = min_idle.as_millis() as usize;

        let mut conn = self.manager.clone();
        let pending: StreamPendingCountReply = self
            .run(async move { conn.xpending_count(stream, group, "-", "+", 64usize).await })
            .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.manager.clone();
        let consumer = consumer.to_string();
        let claimed: StreamClaimReply = self
            .run(async move {
                conn.xclaim(stream, group, &consumer, min_idle_ms, &stale_ids)
                    .await
            })
            .await?;

        let mut out = Vec::new();
        for entry in claimed.ids {
            let mut fields = Fields::new();
            for (name, value) in entry.map {
                match redis::from_redis_value::<String>(&value) {
                    Ok(text) => {
                        fields.insert(name, text);
                    }
                    Err(_) => {
                        tracing::warn!(stream, field = %name, "non-string stream field skipped");
                    }
                }
            }
            out.push((MessageId(entry.id), fields));
        }
        Ok(out)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
