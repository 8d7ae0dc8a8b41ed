use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mailbox::{MailboxDocument, MailboxKey, MailboxStore, MailboxWatch};
use super::SignalingMessage;
use crate::{Error, Result};

/// Initial backoff delay for watcher reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for watcher reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Timeout for Redis connect and subscribe operations
const REDIS_TIMEOUT_SECS: u64 = 5;

const WATCH_BUFFER: usize = 16;

/// Redis-backed mailbox store
///
/// Each mailbox is a hash at `{prefix}{kind}:{recipient}` with one field per
/// sender. Writes update the hash and publish the sender id on the channel
/// `{prefix}{kind}:{recipient}:changed`; watchers re-read the hash on every
/// notification.
#[derive(Clone)]
pub struct RedisMailboxStore {
    client: Client,
    conn: MultiplexedConnection,
    key_prefix: String,
}

enum WatcherExit {
    /// Subscription was healthy and then dropped
    Disconnected,
    ConnectFailed(Error),
    /// Nobody is listening anymore
    Closed,
}

impl RedisMailboxStore {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Connection("Timed out connecting to Redis".to_string()))??;

        info!(redis = %redacted_url(redis_url), "Connected Redis mailbox store");

        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn hash_key(&self, key: &MailboxKey) -> String {
        key.storage_key(&self.key_prefix)
    }

    fn channel(&self, key: &MailboxKey) -> String {
        format!("{}:changed", self.hash_key(key))
    }

    async fn read_document(
        conn: &mut MultiplexedConnection,
        hash_key: &str,
    ) -> Result<MailboxDocument> {
        let fields: HashMap<String, String> = conn.hgetall(hash_key).await?;
        let mut doc = MailboxDocument::default();
        for (sender, json) in fields {
            match serde_json::from_str::<SignalingMessage>(&json) {
                Ok(message) => doc.insert(message),
                Err(e) => {
                    warn!(error = %e, mailbox = %hash_key, sender = %sender, "Skipping undecodable mailbox slot");
                }
            }
        }
        Ok(doc)
    }

    async fn run_watcher(
        client: &Client,
        conn: &mut MultiplexedConnection,
        hash_key: &str,
        channel: &str,
        tx: &mpsc::Sender<MailboxDocument>,
        cancel: &CancellationToken,
    ) -> WatcherExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => return WatcherExit::ConnectFailed(e.into()),
            Err(_) => {
                return WatcherExit::ConnectFailed(Error::Connection(
                    "Timed out getting Redis Pub/Sub connection".to_string(),
                ));
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(channel),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return WatcherExit::ConnectFailed(e.into()),
            Err(_) => {
                return WatcherExit::ConnectFailed(Error::Connection(format!(
                    "Timed out subscribing to {channel}"
                )));
            }
        }

        debug!(channel = %channel, "Mailbox watcher subscribed");

        // Snapshot after subscribing so no write falls between the two
        match Self::read_document(conn, hash_key).await {
            Ok(doc) => {
                if tx.send(doc).await.is_err() {
                    return WatcherExit::Closed;
                }
            }
            Err(e) => return WatcherExit::ConnectFailed(e),
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return WatcherExit::Closed,
                msg = stream.next() => {
                    if msg.is_none() {
                        return WatcherExit::Disconnected;
                    }
                    match Self::read_document(conn, hash_key).await {
                        Ok(doc) => {
                            if tx.send(doc).await.is_err() {
                                return WatcherExit::Closed;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, mailbox = %hash_key, "Failed to re-read mailbox");
                        }
                    }
                }
            }
        }
    }
}

/// Redis URL without credentials, for logs
fn redacted_url(redis_url: &str) -> &str {
    redis_url
        .rsplit_once('@')
        .map_or(redis_url, |(_, host)| host)
}

#[async_trait]
impl MailboxStore for RedisMailboxStore {
    async fn write(&self, key: &MailboxKey, message: &SignalingMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let hash_key = self.hash_key(key);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .hset(&hash_key, message.from.as_str(), json)
            .ignore()
            .publish(self.channel(key), message.from.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::PublishFailure(format!("{hash_key}: {e}")))?;

        debug!(mailbox = %hash_key, message_id = %message.id, "Wrote mailbox slot");
        Ok(())
    }

    async fn watch(&self, key: &MailboxKey) -> Result<MailboxWatch> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let client = self.client.clone();
        let mut conn = self.conn.clone();
        let hash_key = self.hash_key(key);
        let channel = self.channel(key);

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if task_cancel.is_cancelled() {
                    return;
                }

                match Self::run_watcher(&client, &mut conn, &hash_key, &channel, &tx, &task_cancel)
                    .await
                {
                    WatcherExit::Closed => {
                        debug!(mailbox = %hash_key, "Mailbox watcher stopped");
                        return;
                    }
                    WatcherExit::Disconnected => {
                        error!(
                            mailbox = %hash_key,
                            "Mailbox subscription lost, reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    WatcherExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            mailbox = %hash_key,
                            backoff_secs = backoff_secs,
                            "Mailbox watcher failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(MailboxWatch::new(rx, cancel))
    }

    async fn clear(&self, key: &MailboxKey) -> Result<()> {
        let hash_key = self.hash_key(key);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .del(&hash_key)
            .ignore()
            .publish(self.channel(key), "")
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }
}
