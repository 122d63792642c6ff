//! Transport facade over a pub/sub broker client.
//!
//! This module contains:
//! - `Connector` trait: opens one physical broker connection
//! - `Connection` trait: publish, subscribe, reply inboxes, status
//! - Implementations: in-process channel broker, NATS (feature `nats`)
//!
//! The pool never talks to a broker client directly; everything it needs
//! from the transport is expressed here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

// Implementation modules
pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
pub use channel::{ChannelBroker, ChannelConnection, ChannelConnector};
#[cfg(feature = "nats")]
pub use nats::{NatsConnection, NatsConnector};

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Connection is closed")]
    Closed,
}

/// Lifecycle state of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Connected and usable.
    Open,
    /// Permanently closed; the client will not reconnect by itself.
    Closed,
    /// Temporarily disconnected, the client is retrying.
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Open => f.write_str("open"),
            ConnectionStatus::Closed => f.write_str("closed"),
            ConnectionStatus::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub subject: String,
    /// Address the sender expects a reply on, if any.
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// Stream of messages for one subscription.
///
/// Dropping the stream unsubscribes. The stream ends when the owning
/// connection closes.
pub type MessageStream = BoxStream<'static, RawMessage>;

/// Opens broker connections.
///
/// A connector captures the connection parameters used at startup so the
/// health supervisor can open identical replacements later.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one new physical connection.
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One physical connection to the broker.
///
/// Shared by every caller that round-robins through the pool.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Current lifecycle state.
    fn status(&self) -> ConnectionStatus;

    /// Publish a payload, optionally naming a subject to reply on.
    async fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Subscribe to a subject.
    ///
    /// With a queue group, the broker delivers each message to one member of
    /// the group instead of every subscriber.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<MessageStream, TransportError>;

    /// Create a unique subject usable as a single-use reply inbox.
    fn new_inbox(&self) -> String;

    /// Close the connection. Subscriptions end and status becomes `Closed`.
    async fn close(&self);
}
