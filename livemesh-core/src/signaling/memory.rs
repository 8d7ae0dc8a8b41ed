use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::mailbox::{MailboxDocument, MailboxKey, MailboxStore, MailboxWatch};
use super::SignalingMessage;
use crate::Result;

const WATCH_BUFFER: usize = 16;

/// In-process mailbox store
///
/// Every mailbox is a `watch` channel, which gives the snapshot-then-changes
/// delivery of a document store. Peers can only reach each other when they
/// share the same store instance.
#[derive(Clone, Default)]
pub struct MemoryMailboxStore {
    mailboxes: Arc<DashMap<MailboxKey, watch::Sender<MailboxDocument>>>,
}

impl MemoryMailboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, key: &MailboxKey) -> watch::Sender<MailboxDocument> {
        self.mailboxes
            .entry(key.clone())
            .or_insert_with(|| watch::channel(MailboxDocument::default()).0)
            .clone()
    }

    /// Current content of a mailbox
    #[must_use]
    pub fn snapshot(&self, key: &MailboxKey) -> MailboxDocument {
        self.mailboxes
            .get(key)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailboxStore for MemoryMailboxStore {
    async fn write(&self, key: &MailboxKey, message: &SignalingMessage) -> Result<()> {
        let message = message.clone();
        self.sender(key).send_modify(|doc| doc.insert(message));
        debug!(mailbox = %key, "Wrote mailbox slot");
        Ok(())
    }

    async fn watch(&self, key: &MailboxKey) -> Result<MailboxWatch> {
        let mut doc_rx = self.sender(key).subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let snapshot = doc_rx.borrow_and_update().clone();
            if tx.send(snapshot).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    changed = doc_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let doc = doc_rx.borrow_and_update().clone();
                        if tx.send(doc).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(MailboxWatch::new(rx, cancel))
    }

    async fn clear(&self, key: &MailboxKey) -> Result<()> {
        if let Some(tx) = self.mailboxes.get(key) {
            tx.send_modify(MailboxDocument::clear);
        }
        Ok(())
    }
}
