//! NATS transport backed by `async-nats`.
//!
//! Connection status is tracked from the client's event callback. Once the
//! client exhausts `max_reconnects` it reports `Closed`, which is the state
//! the health supervisor replaces.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_nats::{Client, ClientError, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionStatus, Connector, MessageStream, RawMessage, TransportError};
use crate::config::PoolConfig;

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;
const STATUS_RECONNECTING: u8 = 2;

/// Opens NATS connections with the parameters of a [`PoolConfig`].
pub struct NatsConnector {
    server: String,
    name: String,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
    max_reconnects: Option<usize>,
}

impl NatsConnector {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            server: config.server.clone(),
            name: config.event_source(),
            user: config.user.clone(),
            password: config.password.clone(),
            token: config.token.clone(),
            max_reconnects: config.max_reconnects,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn options(&self, status: Arc<AtomicU8>) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .name(&self.name)
            .max_reconnects(self.max_reconnects);

        options = match (&self.user, &self.password, &self.token) {
            (Some(user), Some(password), _) => {
                options.user_and_password(user.clone(), password.clone())
            }
            (_, _, Some(token)) => options.token(token.clone()),
            _ => options,
        };

        options.event_callback(move |event| {
            let status = Arc::clone(&status);
            async move {
                match event {
                    Event::Connected => {
                        debug!("NATS connection established");
                        status.store(STATUS_OPEN, Ordering::SeqCst);
                    }
                    Event::Disconnected => {
                        warn!("NATS connection lost, client reconnecting");
                        status.store(STATUS_RECONNECTING, Ordering::SeqCst);
                    }
                    Event::Closed | Event::ClientError(ClientError::MaxReconnects) => {
                        warn!("NATS connection closed");
                        status.store(STATUS_CLOSED, Ordering::SeqCst);
                    }
                    other => debug!(event = %other, "NATS client event"),
                }
            }
        })
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let status = Arc::new(AtomicU8::new(STATUS_OPEN));
        let client = self
            .options(Arc::clone(&status))
            .connect(&self.server)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(server = %self.server, name = %self.name, "Connected to NATS");
        Ok(Arc::new(NatsConnection { client, status }))
    }
}

/// One NATS client connection.
pub struct NatsConnection {
    client: Client,
    status: Arc<AtomicU8>,
}

impl NatsConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        match self.status() {
            ConnectionStatus::Closed => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for NatsConnection {
    fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_OPEN => ConnectionStatus::Open,
            STATUS_RECONNECTING => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Closed,
        }
    }

    #[tracing::instrument(name = "nats.publish", skip_all, fields(subject = %subject))]
    async fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let result = match reply_to {
            Some(reply_to) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply_to.to_string(), payload)
                    .await
            }
            None => self.client.publish(subject.to_string(), payload).await,
        };
        result.map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<MessageStream, TransportError> {
        self.ensure_usable()?;
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let stream = subscriber.map(|message| RawMessage {
            subject: message.subject.to_string(),
            reply_to: message.reply.map(|reply| reply.to_string()),
            payload: message.payload,
        });
        Ok(stream.boxed())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn close(&self) {
        if let Err(e) = self.client.drain().await {
            debug!(error = %e, "NATS drain failed");
        }
        self.status.store(STATUS_CLOSED, Ordering::SeqCst);
    }
}
