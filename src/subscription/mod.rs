//! Subscription declarations, message handlers, and the replay registry.
//!
//! The registry remembers which (handler, subject, queue group) triples are
//! active on each pooled connection so they can be replayed onto a
//! replacement when the connection closes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::{Error, HandlerError, Result};
use crate::pool::ConnectionId;
use crate::transport::{Connection, RawMessage};

/// A message delivered to a subscribed handler.
#[derive(Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
    /// Connection the message arrived on; replies go out through it.
    pub connection: Arc<dyn Connection>,
}

impl InboundMessage {
    pub(crate) fn from_raw(raw: RawMessage, connection: Arc<dyn Connection>) -> Self {
        Self {
            subject: raw.subject,
            reply_to: raw.reply_to,
            payload: raw.payload,
            connection,
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("reply_to", &self.reply_to)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Future returned by a [`MessageHandler`].
pub type HandlerFuture = BoxFuture<'static, std::result::Result<(), HandlerError>>;

/// Handler bound to a subscribed subject.
///
/// Takes exactly the raw inbound message. Errors are logged by the delivery
/// task and never reach the transport.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage) -> HandlerFuture;
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, message: InboundMessage) -> HandlerFuture {
        self(message)
    }
}

/// "Subscribe to subject X, optionally as part of queue group Y."
///
/// Produced by the host's discovery step. An empty `queue` means no group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscribeDeclaration {
    pub subject: String,
    pub queue: String,
}

impl SubscribeDeclaration {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            queue: String::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Queue group, if one was declared.
    pub fn queue_group(&self) -> Option<&str> {
        if self.queue.is_empty() {
            None
        } else {
            Some(&self.queue)
        }
    }

    /// Reject declarations that cannot be bound to a broker subscription.
    pub fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(Error::InvalidHandlerSignature(
                "subscription subject is empty".to_string(),
            ));
        }
        if self.subject.contains(char::is_whitespace) {
            return Err(Error::InvalidHandlerSignature(format!(
                "subscription subject '{}' contains whitespace",
                self.subject
            )));
        }
        if self.queue.contains(char::is_whitespace) {
            return Err(Error::InvalidHandlerSignature(format!(
                "queue group '{}' contains whitespace",
                self.queue
            )));
        }
        Ok(())
    }
}

/// One active subscription, replayable onto another connection.
///
/// Identity is (handler pointer, subject, queue group): registering the same
/// handler value twice for the same subject and group is a no-op.
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub handler: Arc<dyn MessageHandler>,
    pub subject: String,
    pub queue_group: Option<String>,
}

impl SubscriptionEntry {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        subject: impl Into<String>,
        queue_group: Option<String>,
    ) -> Self {
        Self {
            handler,
            subject: subject.into(),
            queue_group,
        }
    }

    fn handler_addr(&self) -> usize {
        Arc::as_ptr(&self.handler) as *const () as usize
    }
}

impl PartialEq for SubscriptionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.handler_addr() == other.handler_addr()
            && self.subject == other.subject
            && self.queue_group == other.queue_group
    }
}

impl Eq for SubscriptionEntry {}

impl Hash for SubscriptionEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handler_addr().hash(state);
        self.subject.hash(state);
        self.queue_group.hash(state);
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("handler", &format_args!("{:#x}", self.handler_addr()))
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish()
    }
}

/// Active subscriptions per pooled connection.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<ConnectionId, HashSet<SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry. Returns false if it was already present.
    pub fn record(&mut self, connection: ConnectionId, entry: SubscriptionEntry) -> bool {
        self.entries.entry(connection).or_default().insert(entry)
    }

    /// Whether an identical entry is already recorded for the connection.
    pub fn contains(&self, connection: ConnectionId, entry: &SubscriptionEntry) -> bool {
        self.entries
            .get(&connection)
            .is_some_and(|set| set.contains(entry))
    }

    /// Entries recorded against a connection, in no particular order.
    pub fn entries_for(&self, connection: ConnectionId) -> Vec<SubscriptionEntry> {
        self.entries
            .get(&connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Move every entry of `old` to `new`, leaving nothing under `old`.
    pub fn migrate(&mut self, old: ConnectionId, new: ConnectionId) -> usize {
        let Some(moved) = self.entries.remove(&old) else {
            return 0;
        };
        let count = moved.len();
        self.entries.entry(new).or_default().extend(moved);
        count
    }

    /// Drop every entry recorded against a connection.
    pub fn forget(&mut self, connection: ConnectionId) -> usize {
        self.entries.remove(&connection).map_or(0, |set| set.len())
    }

    /// Total number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
