//! Error taxonomy for pool, codec, and request/reply operations.

use std::time::Duration;

use crate::codec::{EncodeError, FrameError};
use crate::transport::TransportError;

/// Result type for brokerpool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by application handlers and event processors.
///
/// Its `Display` text becomes the body of a failure response.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while using the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool currently holds no connection to hand out.
    #[error("no broker connection available in the pool")]
    PoolExhausted,

    /// Caller input violates frame constraints.
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodeError),

    /// Corrupt or truncated wire data.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// No reply arrived on the reply inbox before the deadline.
    #[error("no reply received within {0:?}")]
    RequestTimeout(Duration),

    /// No processor is registered for the event type.
    #[error("no event processor registered for event type '{0}'")]
    UnknownEventType(String),

    /// A subscription declaration cannot be bound to a handler.
    #[error("invalid subscription handler: {0}")]
    InvalidHandlerSignature(String),

    /// Two processors claim the same event type.
    #[error("event type '{0}' already has a registered processor")]
    DuplicateEventType(String),

    /// Failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON body (de)serialization failed.
    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Returns true when retrying the same operation later may succeed.
    ///
    /// Exhausted pools recover once the supervisor replaces a connection and
    /// timeouts are a caller decision. Codec and registration errors never
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted | Error::RequestTimeout(_) | Error::Transport(_)
        )
    }
}
