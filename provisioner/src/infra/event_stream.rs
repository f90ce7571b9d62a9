//! Consumer of the provider's result stream.
//!
//! Reads `vdi:infra:events` through a consumer group and hands each entry's
//! `body` field to the [`InfraEventListener`]. Every entry is acknowledged,
//! including ones the listener drops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::task::JoinHandle;
use vdi_common::{ValkeyConfig, keys};

use crate::application::services::event_listener::InfraEventListener;

const BATCH: usize = 16;
const BLOCK_MS: usize = 5_000;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct InfraEventStream {
    conn: MultiplexedConnection,
    group: String,
    consumer: String,
}

impl InfraEventStream {
    /// Open a dedicated connection (blocking reads would stall a shared one)
    /// and make sure the consumer group exists.
    ///
    /// # Errors
    ///
    /// Returns an error if Valkey is unreachable or the group cannot be created.
    pub async fn connect(config: &ValkeyConfig) -> Result<Self> {
        let client =
            redis::Client::open(config.url.as_str()).context("failed to create Valkey client")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Valkey event stream")?;

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(keys::INFRA_EVENTS, &config.consumer_group, "$")
            .await;
        match created {
            Ok(()) => tracing::info!(
                group = %config.consumer_group,
                "created infra event consumer group"
            ),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e).context("XGROUP CREATE failed"),
        }

        Ok(Self {
            conn,
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
        })
    }

    /// Read one batch, dispatch it, acknowledge it. Returns the number of
    /// entries handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or an acknowledgement fails.
    pub async fn poll_once(&mut self, listener: &InfraEventListener) -> Result<usize> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(BATCH)
            .block(BLOCK_MS);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[keys::INFRA_EVENTS], &[">"], &options)
            .await
            .context("XREADGROUP failed")?;
        let Some(reply) = reply else {
            return Ok(0);
        };

        let mut handled = 0;
        for stream in reply.keys {
            for entry in stream.ids {
                let body: Option<String> = entry.get("body");
                match body {
                    Some(body) => {
                        let disposition = listener.on_message(&body).await;
                        tracing::debug!(entry = %entry.id, ?disposition, "infra event handled");
                    }
                    None => tracing::warn!(entry = %entry.id, "infra event without body field"),
                }
                let _: i64 = self
                    .conn
                    .xack(keys::INFRA_EVENTS, &self.group, &[&entry.id])
                    .await
                    .context("XACK failed")?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Consume until the returned handle is aborted. Read errors are logged
    /// and retried after a short delay.
    pub fn spawn(mut self, listener: Arc<InfraEventListener>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                group = %self.group,
                consumer = %self.consumer,
                "infra event consumer started"
            );
            loop {
                if let Err(e) = self.poll_once(&listener).await {
                    tracing::warn!(error = %format!("{e:#}"), "infra event stream read failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        })
    }
}
