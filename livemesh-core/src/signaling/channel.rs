use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::mailbox::{MailboxKey, MailboxStore};
use super::{MessageKind, SignalPayload, SignalingMessage};
use crate::{types::PeerId, Error, Result};

/// Receives every message seen in the local mailboxes
///
/// Called once per message per mailbox notification, so the same message can
/// arrive several times.
#[async_trait]
pub trait SignalingHandler: Send + Sync {
    async fn on_message(&self, message: SignalingMessage);
}

/// Live subscription to the three local mailboxes; cancelled on drop
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
}

impl Subscription {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sends and receives signaling messages for one local peer
///
/// Outgoing messages are stamped with the channel's session id so remote
/// peers can tell a restarted sender from the previous one.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn MailboxStore>,
    local: PeerId,
    session_id: String,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn MailboxStore>, local: PeerId) -> Self {
        Self {
            store,
            local,
            session_id: nanoid::nanoid!(12),
        }
    }

    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        &self.local
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Watch the offer, answer and candidate mailboxes addressed to the
    /// local peer and hand every message to `handler`.
    pub async fn subscribe(&self, handler: Arc<dyn SignalingHandler>) -> Result<Subscription> {
        let cancel = CancellationToken::new();

        for kind in MessageKind::ALL {
            let key = MailboxKey::new(kind, self.local.clone());
            let mut watch = match self.store.watch(&key).await {
                Ok(watch) => watch,
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            };
            let handler = handler.clone();
            let cancel = cancel.clone();
            let local = self.local.clone();

            tokio::spawn(async move {
                loop {
                    let doc = tokio::select! {
                        () = cancel.cancelled() => break,
                        doc = watch.next() => match doc {
                            Some(doc) => doc,
                            None => break,
                        },
                    };

                    for message in doc.messages() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if message.to != local || message.kind() != kind {
                            warn!(
                                mailbox = %key,
                                message_id = %message.id,
                                from = %message.from,
                                "Dropping misaddressed signaling message"
                            );
                            continue;
                        }
                        handler.on_message(message.clone()).await;
                    }
                }
                debug!(mailbox = %key, "Mailbox subscription ended");
            });
        }

        debug!(peer_id = %self.local, "Subscribed to signaling mailboxes");
        Ok(Subscription { cancel })
    }

    /// Build a message from the local peer without sending it, so its id
    /// can be recorded before anyone can reply to it.
    #[must_use]
    pub fn prepare(&self, to: &PeerId, payload: SignalPayload) -> SignalingMessage {
        SignalingMessage::new(self.local.clone(), to.clone(), payload)
            .with_session(self.session_id.as_str())
    }

    /// Write `message` into the recipient's mailbox, replacing the previous
    /// message of the same kind from the local peer.
    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        let key = MailboxKey::new(message.kind(), message.to.clone());

        self.store.write(&key, message).await.map_err(|e| match e {
            Error::PublishFailure(_) => e,
            other => Error::PublishFailure(format!("{key}: {other}")),
        })?;

        debug!(
            to = %message.to,
            kind = ?message.kind(),
            message_id = %message.id,
            "Published signaling message"
        );
        Ok(())
    }

    /// `prepare` then `send`
    pub async fn publish(&self, to: &PeerId, payload: SignalPayload) -> Result<SignalingMessage> {
        let message = self.prepare(to, payload);
        self.send(&message).await?;
        Ok(message)
    }

    /// Empty every mailbox addressed to the local peer.
    pub async fn clear(&self) -> Result<()> {
        for kind in MessageKind::ALL {
            self.store
                .clear(&MailboxKey::new(kind, self.local.clone()))
                .await?;
        }
        Ok(())
    }
}
