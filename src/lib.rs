//! Brokerpool - pooled pub/sub messaging
//!
//! A pool of broker connections shared by request/reply callers and event
//! subscribers, with a health supervisor that replaces closed connections
//! and replays their subscriptions.

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod subscription;
pub mod supervisor;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use client::{RequestClient, Response};
pub use config::PoolConfig;
pub use dispatch::{DispatchResult, EventDispatcher, EventProcessor, ProcessorRegistry};
pub use error::{Error, HandlerError, Result};
pub use pool::{ConnectionId, ConnectionPool, PooledConnection};
pub use subscription::{InboundMessage, MessageHandler, SubscribeDeclaration};
pub use supervisor::{HealthSupervisor, SupervisorHandle};
