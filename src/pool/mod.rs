//! Pool of broker connections with round-robin hand-out and replacement.
//!
//! Readers (`pick`, `snapshot`) copy an `Arc` of the current immutable
//! connection list under a short read lock and never wait on I/O.
//! Every mutation (registration, replacement) is serialised by the
//! subscription registry mutex, which is always taken before the list lock,
//! so a resubscription and a new registration can never lose each other's
//! updates.

use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::subscription::{
    InboundMessage, MessageHandler, SubscribeDeclaration, SubscriptionEntry, SubscriptionRegistry,
};
use crate::transport::{
    Connection, ConnectionStatus, Connector, MessageStream, TransportError,
};

/// Pool-assigned identity of a connection.
///
/// Identities are never reused, so a replacement is always distinguishable
/// from the connection it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection handed out by the pool.
///
/// Cheap to clone; derefs to the underlying [`Connection`].
#[derive(Clone)]
pub struct PooledConnection {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("status", &self.connection.status())
            .finish()
    }
}

/// Result of swapping one closed connection for a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replacement {
    pub old: ConnectionId,
    pub new: ConnectionId,
    /// Subscriptions replayed onto the new connection.
    pub resubscribed: usize,
}

/// Round-robin pool of broker connections.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: RwLock<Arc<Vec<PooledConnection>>>,
    subscriptions: Mutex<SubscriptionRegistry>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Open `connection_total` connections (at least one).
    ///
    /// Fails with the first connect error; connections opened before the
    /// failure are closed again.
    pub async fn connect(connector: Arc<dyn Connector>, config: &PoolConfig) -> Result<Self> {
        let total = config.connection_total.max(1);
        let mut connections = Vec::with_capacity(total);

        for _ in 0..total {
            match connector.connect().await {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    error!(error = %e, server = %config.server, "Failed to open pool connection");
                    for connection in &connections {
                        connection.close().await;
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            server = %config.server,
            connections = connections.len(),
            "Connection pool started"
        );
        Ok(Self::from_connections(connector, connections))
    }

    /// Build a pool around already-open connections.
    ///
    /// An empty list is allowed; `pick` then fails with `PoolExhausted`.
    pub fn from_connections(
        connector: Arc<dyn Connector>,
        connections: Vec<Arc<dyn Connection>>,
    ) -> Self {
        let next_id = AtomicU64::new(0);
        let pooled = connections
            .into_iter()
            .map(|connection| PooledConnection {
                id: ConnectionId(next_id.fetch_add(1, Ordering::Relaxed)),
                connection,
            })
            .collect();

        Self {
            connector,
            connections: RwLock::new(Arc::new(pooled)),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            cursor: AtomicUsize::new(0),
            next_id,
        }
    }

    /// Connector used to open replacements.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Current connection list. Immutable; later swaps do not affect it.
    pub fn snapshot(&self) -> Arc<Vec<PooledConnection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Look up a pooled connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<PooledConnection> {
        self.snapshot().iter().find(|c| c.id == id).cloned()
    }

    /// Hand out the next connection in round-robin order.
    ///
    /// When the cursor has run past the end (or the pool shrank), it wraps
    /// to the first connection and keeps counting from there.
    pub fn pick(&self) -> Result<PooledConnection> {
        let snapshot = self.snapshot();
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        if let Some(connection) = snapshot.get(index) {
            return Ok(connection.clone());
        }

        let first = snapshot.first().cloned().ok_or(Error::PoolExhausted)?;
        self.cursor.store(1, Ordering::Relaxed);
        Ok(first)
    }

    /// Subscribe a handler on the next round-robin connection.
    ///
    /// Returns the connection the subscription was bound to.
    pub async fn register(
        &self,
        handler: Arc<dyn MessageHandler>,
        declaration: &SubscribeDeclaration,
    ) -> Result<PooledConnection> {
        declaration.validate()?;
        let connection = self.pick()?;
        self.register_on(
            &connection,
            handler,
            &declaration.subject,
            declaration.queue_group(),
        )
        .await?;
        Ok(connection)
    }

    /// Subscribe a handler on a specific pooled connection and record it
    /// for replay.
    ///
    /// Registering an identical (handler, subject, queue group) again on
    /// the same connection is a no-op.
    pub async fn register_on(
        &self,
        connection: &PooledConnection,
        handler: Arc<dyn MessageHandler>,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<()> {
        let declaration = SubscribeDeclaration {
            subject: subject.to_string(),
            queue: queue_group.unwrap_or_default().to_string(),
        };
        declaration.validate()?;

        let entry = SubscriptionEntry::new(
            handler,
            subject,
            declaration.queue_group().map(str::to_string),
        );

        let mut registry = self.subscriptions.lock().await;
        if self.get(connection.id).is_none() {
            // Already swapped out; recording against it would never replay.
            return Err(TransportError::Closed.into());
        }
        if registry.contains(connection.id, &entry) {
            debug!(
                connection = %connection.id,
                subject = %subject,
                "Subscription already registered"
            );
            return Ok(());
        }

        start_delivery(connection, &entry).await?;
        registry.record(connection.id, entry);

        info!(
            connection = %connection.id,
            subject = %subject,
            queue_group = ?queue_group,
            "Handler subscribed"
        );
        Ok(())
    }

    /// Subscriptions currently recorded against a connection.
    pub async fn subscriptions_for(&self, id: ConnectionId) -> Vec<SubscriptionEntry> {
        self.subscriptions.lock().await.entries_for(id)
    }

    /// Total number of recorded subscriptions across the pool.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Connections currently reporting `Closed`.
    pub fn closed_connections(&self) -> Vec<PooledConnection> {
        self.snapshot()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::Closed)
            .cloned()
            .collect()
    }

    /// Replace one connection. See [`ConnectionPool::replace_batch`].
    pub async fn replace(
        &self,
        old: ConnectionId,
        new: Arc<dyn Connection>,
    ) -> Result<Replacement> {
        self.replace_batch(vec![(old, new)])
            .await
            .pop()
            .unwrap_or(Err(Error::PoolExhausted))
    }

    /// Swap a batch of connections for their replacements.
    ///
    /// Each replacement first receives every subscription recorded for the
    /// connection it replaces. Replacements whose resubscription fails are
    /// closed and their old connection stays in place. The accepted ones are
    /// then appended and the old ones removed in a single exclusive swap, so
    /// no reader ever sees a list missing both or containing both. Replaced
    /// connections are closed after the swap, open or not.
    ///
    /// Results are returned in input order.
    pub async fn replace_batch(
        &self,
        replacements: Vec<(ConnectionId, Arc<dyn Connection>)>,
    ) -> Vec<Result<Replacement>> {
        let mut registry = self.subscriptions.lock().await;
        let current = self.snapshot();

        let mut results = Vec::with_capacity(replacements.len());
        let mut accepted: Vec<(ConnectionId, PooledConnection, usize)> = Vec::new();

        for (old, connection) in replacements {
            let known = current.iter().any(|c| c.id == old);
            let already_replaced = accepted.iter().any(|(id, _, _)| *id == old);
            if !known || already_replaced {
                warn!(connection = %old, "Replacement target is not in the pool");
                connection.close().await;
                results.push(Err(TransportError::Closed.into()));
                continue;
            }

            let new = PooledConnection {
                id: self.allocate_id(),
                connection,
            };
            match resubscribe(&new, &registry.entries_for(old)).await {
                Ok(count) => {
                    results.push(Ok(Replacement {
                        old,
                        new: new.id,
                        resubscribed: count,
                    }));
                    accepted.push((old, new, count));
                }
                Err(e) => {
                    warn!(
                        connection = %old,
                        replacement = %new.id,
                        error = %e,
                        "Resubscription failed, keeping closed connection for next attempt"
                    );
                    new.connection.close().await;
                    results.push(Err(e.into()));
                }
            }
        }

        if accepted.is_empty() {
            return results;
        }

        {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next: Vec<PooledConnection> = connections
                .iter()
                .filter(|c| !accepted.iter().any(|(old, _, _)| *old == c.id))
                .cloned()
                .collect();
            next.extend(accepted.iter().map(|(_, new, _)| new.clone()));
            *connections = Arc::new(next);
        }

        for (old, new, resubscribed) in &accepted {
            registry.migrate(*old, new.id);
            info!(
                old = %old,
                new = %new.id,
                resubscribed,
                "Replaced connection"
            );
        }
        drop(registry);

        // Ends the old delivery streams; their entries now live on the replacement.
        for retired in current
            .iter()
            .filter(|c| accepted.iter().any(|(old, _, _)| *old == c.id))
        {
            if retired.status() != ConnectionStatus::Closed {
                debug!(connection = %retired.id, "Closing replaced connection");
            }
            retired.close().await;
        }

        results
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        for connection in self.snapshot().iter() {
            connection.close().await;
        }
        info!("Connection pool closed");
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Replay recorded subscriptions onto a new connection.
async fn resubscribe(
    connection: &PooledConnection,
    entries: &[SubscriptionEntry],
) -> std::result::Result<usize, TransportError> {
    for entry in entries {
        start_delivery(connection, entry).await?;
    }
    Ok(entries.len())
}

/// Subscribe `entry` on `connection` and spawn its delivery task.
async fn start_delivery(
    connection: &PooledConnection,
    entry: &SubscriptionEntry,
) -> std::result::Result<(), TransportError> {
    let stream = connection
        .subscribe(&entry.subject, entry.queue_group.as_deref())
        .await?;

    tokio::spawn(deliver(
        stream,
        Arc::clone(&entry.handler),
        Arc::clone(&connection.connection),
        connection.id,
        entry.subject.clone(),
    ));
    Ok(())
}

/// Feed one subscription's messages to its handler until the stream ends.
///
/// Handler errors and panics are logged here and never reach the transport.
async fn deliver(
    mut stream: MessageStream,
    handler: Arc<dyn MessageHandler>,
    connection: Arc<dyn Connection>,
    id: ConnectionId,
    subject: String,
) {
    while let Some(raw) = stream.next().await {
        let message = InboundMessage::from_raw(raw, Arc::clone(&connection));
        let outcome = AssertUnwindSafe(async { handler.handle(message).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(connection = %id, subject = %subject, error = %e, "Message handler failed");
            }
            Err(_) => {
                error!(connection = %id, subject = %subject, "Message handler panicked");
            }
        }
    }
    debug!(connection = %id, subject = %subject, "Subscription stream ended");
}
