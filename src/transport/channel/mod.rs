//! In-memory broker for standalone mode and tests.
//!
//! Uses tokio unbounded channels for pub/sub within a single process.
//! Follows NATS subject semantics (`*` and `>` wildcards, queue groups,
//! reply inboxes) so code exercised here behaves the same against a real
//! broker.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Connection, ConnectionStatus, Connector, MessageStream, RawMessage, TransportError};

/// Prefix for generated reply inboxes.
const INBOX_PREFIX: &str = "_INBOX";

/// Check if a subject matches a subscription filter.
///
/// Matching rules:
/// - Tokens are separated by `.`
/// - `*` matches exactly one token
/// - `>` as the last filter token matches one or more remaining tokens
fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct SubscriptionSlot {
    connection: u64,
    filter: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct BrokerState {
    /// Ordered by subscription id so queue-group rotation is deterministic.
    subscriptions: BTreeMap<u64, SubscriptionSlot>,
    /// Next member index per (filter, queue group).
    queue_cursors: HashMap<(String, String), usize>,
}

#[derive(Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    next_subscription: AtomicU64,
    next_connection: AtomicU64,
}

impl BrokerShared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscriptions.remove(&id);
    }
}

/// In-process broker shared by every connection created against it.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    shared: Arc<BrokerShared>,
}

impl ChannelBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection directly, bypassing a connector.
    pub fn connection(&self) -> Arc<ChannelConnection> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        Arc::new(ChannelConnection {
            id,
            broker: self.clone(),
            status: AtomicU8::new(STATUS_OPEN),
        })
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.len()
    }

    /// Number of live subscriptions whose filter is exactly `subject`.
    pub fn subscribers_of(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .values()
            .filter(|slot| slot.filter == subject)
            .count()
    }

    fn subscribe(
        &self,
        connection: u64,
        filter: &str,
        queue_group: Option<&str>,
    ) -> ChannelSubscription {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.lock().subscriptions.insert(
            id,
            SubscriptionSlot {
                connection,
                filter: filter.to_string(),
                queue_group: queue_group.map(str::to_string),
                sender,
            },
        );
        ChannelSubscription {
            id,
            receiver: UnboundedReceiverStream::new(receiver),
            broker: Arc::downgrade(&self.shared),
        }
    }

    /// Route a message to matching subscribers. Returns the delivery count.
    fn route(&self, message: RawMessage) -> usize {
        let mut state = self.shared.lock();
        let BrokerState {
            subscriptions,
            queue_cursors,
        } = &mut *state;

        let mut targets = Vec::new();
        let mut groups: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
        for (id, slot) in subscriptions.iter() {
            if !subject_matches(&slot.filter, &message.subject) {
                continue;
            }
            match &slot.queue_group {
                None => targets.push(*id),
                Some(group) => groups
                    .entry((slot.filter.clone(), group.clone()))
                    .or_default()
                    .push(*id),
            }
        }

        for (key, members) in groups {
            let cursor = queue_cursors.entry(key).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        let mut delivered = 0;
        for id in targets {
            if let Some(slot) = subscriptions.get(&id) {
                if slot.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn drop_connection(&self, connection: u64) {
        self.shared
            .lock()
            .subscriptions
            .retain(|_, slot| slot.connection != connection);
    }
}

/// Subscription stream that unsubscribes when dropped.
struct ChannelSubscription {
    id: u64,
    receiver: UnboundedReceiverStream<RawMessage>,
    broker: Weak<BrokerShared>,
}

impl Stream for ChannelSubscription {
    type Item = RawMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(self.id);
        }
    }
}

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;
const STATUS_RECONNECTING: u8 = 2;

fn encode_status(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Open => STATUS_OPEN,
        ConnectionStatus::Closed => STATUS_CLOSED,
        ConnectionStatus::Reconnecting => STATUS_RECONNECTING,
    }
}

/// Connection to a [`ChannelBroker`].
pub struct ChannelConnection {
    id: u64,
    broker: ChannelBroker,
    status: AtomicU8,
}

impl ChannelConnection {
    /// Broker-assigned connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Force a status without closing, e.g. to simulate a reconnect cycle.
    pub fn set_status(&self, status: ConnectionStatus) {
        if status == ConnectionStatus::Closed {
            self.broker.drop_connection(self.id);
        }
        self.status.store(encode_status(status), Ordering::SeqCst);
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        match self.status() {
            ConnectionStatus::Closed => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_OPEN => ConnectionStatus::Open,
            STATUS_RECONNECTING => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Closed,
        }
    }

    #[tracing::instrument(name = "channel.publish", skip_all, fields(subject = %subject))]
    async fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let receivers = self.broker.route(RawMessage {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        });
        debug!(receivers, "Published message to channel broker");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<MessageStream, TransportError> {
        self.ensure_usable()?;
        if subject.is_empty() {
            return Err(TransportError::Subscribe("empty subject".to_string()));
        }
        let subscription = self.broker.subscribe(self.id, subject, queue_group);
        // Closed concurrently; dropping the subscription removes its slot.
        self.ensure_usable()?;
        Ok(Box::pin(subscription))
    }

    fn new_inbox(&self) -> String {
        format!("{}.{}", INBOX_PREFIX, Uuid::new_v4().simple())
    }

    async fn close(&self) {
        self.set_status(ConnectionStatus::Closed);
        debug!(connection = self.id, "Channel connection closed");
    }
}

/// Connector that opens connections against one [`ChannelBroker`].
///
/// Can be told to fail upcoming connect attempts to simulate an
/// unreachable broker.
pub struct ChannelConnector {
    broker: ChannelBroker,
    fail_next: AtomicUsize,
    opened: AtomicUsize,
}

impl ChannelConnector {
    pub fn new(broker: ChannelBroker) -> Self {
        Self {
            broker,
            fail_next: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        }
    }

    /// The broker connections are opened against.
    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of connections successfully opened so far.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect(
                "channel broker refused connection".to_string(),
            ));
        }

        let connection = self.broker.connection();
        self.opened.fetch_add(1, Ordering::SeqCst);
        info!(connection = connection.id(), "Channel connection opened");
        Ok(connection)
    }
}
