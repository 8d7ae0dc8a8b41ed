//! Document mailbox boundary
//!
//! A mailbox is one document per `(kind, recipient)`. Each sender owns a
//! single slot in it, so a new write from the same sender replaces the
//! previous one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{MessageKind, SignalingMessage};
use crate::{types::PeerId, Result};

/// Address of one mailbox document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxKey {
    pub kind: MessageKind,
    pub recipient: PeerId,
}

impl MailboxKey {
    pub fn new(kind: MessageKind, recipient: impl Into<PeerId>) -> Self {
        Self {
            kind,
            recipient: recipient.into(),
        }
    }

    /// Storage path under `prefix`, e.g. `livemesh:offers:bob`
    #[must_use]
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{}:{}", self.kind.as_str(), self.recipient)
    }
}

impl fmt::Display for MailboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.recipient)
    }
}

/// Current content of a mailbox: the latest message of every sender
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDocument {
    slots: HashMap<PeerId, SignalingMessage>,
}

impl MailboxDocument {
    /// Put `message` into its sender's slot, replacing what was there.
    pub fn insert(&mut self, message: SignalingMessage) {
        self.slots.insert(message.from.clone(), message);
    }

    #[must_use]
    pub fn get(&self, sender: &PeerId) -> Option<&SignalingMessage> {
        self.slots.get(sender)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Messages ordered by send time
    #[must_use]
    pub fn messages(&self) -> Vec<&SignalingMessage> {
        let mut messages: Vec<_> = self.slots.values().collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }
}

impl FromIterator<SignalingMessage> for MailboxDocument {
    fn from_iter<I: IntoIterator<Item = SignalingMessage>>(iter: I) -> Self {
        let mut doc = Self::default();
        for message in iter {
            doc.insert(message);
        }
        doc
    }
}

/// Live view of one mailbox
///
/// Yields the current document once on subscription, then again after every
/// write. The same document may be yielded more than once. Dropping the
/// watch stops the task feeding it.
pub struct MailboxWatch {
    rx: mpsc::Receiver<MailboxDocument>,
    _guard: DropGuard,
}

impl MailboxWatch {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<MailboxDocument>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next snapshot, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<MailboxDocument> {
        self.rx.recv().await
    }
}

/// Storage backend for signaling mailboxes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Write `message` into the sender's slot of the mailbox at `key`.
    async fn write(&self, key: &MailboxKey, message: &SignalingMessage) -> Result<()>;

    /// Watch the mailbox at `key`.
    async fn watch(&self, key: &MailboxKey) -> Result<MailboxWatch>;

    /// Remove every slot of the mailbox at `key`.
    async fn clear(&self, key: &MailboxKey) -> Result<()>;
}
