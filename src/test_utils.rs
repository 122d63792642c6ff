//! Test utilities and handler doubles.
//!
//! Everything here runs against the in-process channel transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::HandlerError;
use crate::pool::ConnectionPool;
use crate::subscription::{HandlerFuture, InboundMessage, MessageHandler};
use crate::transport::{ChannelBroker, ChannelConnector, Connection, Connector};

/// Handler that counts deliveries and keeps their payloads.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<Bytes>>>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(&self, message: InboundMessage) -> HandlerFuture {
        let count = Arc::clone(&self.count);
        let payloads = Arc::clone(&self.payloads);
        Box::pin(async move {
            if let Ok(mut p) = payloads.lock() {
                p.push(message.payload);
            }
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// How a [`FaultyHandler`] misbehaves on its first delivery.
#[derive(Clone, Copy)]
pub enum Fault {
    Error,
    Panic,
}

/// Handler that misbehaves once, then counts deliveries.
pub struct FaultyHandler {
    fault: Fault,
    seen: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
}

impl FaultyHandler {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            seen: Arc::new(AtomicUsize::new(0)),
            handled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handled(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.handled)
    }
}

impl MessageHandler for FaultyHandler {
    fn handle(&self, _message: InboundMessage) -> HandlerFuture {
        let first = self.seen.fetch_add(1, Ordering::SeqCst) == 0;
        let fault = self.fault;
        let handled = Arc::clone(&self.handled);
        Box::pin(async move {
            if first {
                match fault {
                    Fault::Error => return Err(HandlerError::from("first delivery rejected")),
                    Fault::Panic => panic!("first delivery panicked"),
                }
            }
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Pool of `size` channel connections plus the connector behind it.
pub async fn channel_pool(size: usize) -> (Arc<ChannelConnector>, ConnectionPool) {
    let connector = Arc::new(ChannelConnector::new(ChannelBroker::new()));
    let mut connections: Vec<Arc<dyn Connection>> = Vec::with_capacity(size);
    for _ in 0..size {
        if let Ok(connection) = connector.connect().await {
            connections.push(connection);
        }
    }
    let pool = ConnectionPool::from_connections(connector.clone(), connections);
    (connector, pool)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
