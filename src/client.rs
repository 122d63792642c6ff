//! Request/reply client.
//!
//! Sends an event frame on a pooled connection and waits for the single
//! response frame on a fresh reply inbox.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{decode_response, encode_event};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::transport::TransportError;

/// Decoded reply to a [`RequestClient::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
    /// Response body, JSON by convention.
    pub data: String,
}

impl Response {
    /// Deserialize the response body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Client for request/reply and fire-and-forget events over the pool.
#[derive(Clone)]
pub struct RequestClient {
    pool: Arc<ConnectionPool>,
    default_timeout: Duration,
}

impl RequestClient {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the timeout used by [`RequestClient::call`].
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Send an event and wait for its response with the default timeout.
    pub async fn call(&self, subject: &str, event_name: &str, body: &str) -> Result<Response> {
        self.call_with_timeout(subject, event_name, body, self.default_timeout)
            .await
    }

    /// Send an event and wait up to `timeout` for its response.
    ///
    /// The reply inbox is subscribed before the event is published. The
    /// inbox subscription is released on every exit path.
    #[tracing::instrument(name = "client.call", skip(self, body, timeout), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn call_with_timeout(
        &self,
        subject: &str,
        event_name: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<Response> {
        let frame = encode_event(event_name, body)?;
        let connection = self.pool.pick()?;
        let inbox = connection.new_inbox();

        let mut replies = connection.subscribe(&inbox, None).await?;
        connection.publish(subject, Some(&inbox), frame).await?;
        debug!(connection = %connection.id(), inbox = %inbox, "Request published");

        let reply = match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                warn!(connection = %connection.id(), "Reply stream ended before a response");
                return Err(TransportError::Closed.into());
            }
            Err(_) => {
                warn!(connection = %connection.id(), "Request timed out");
                return Err(Error::RequestTimeout(timeout));
            }
        };
        drop(replies);

        let response = decode_response(&reply.payload)?;
        Ok(Response {
            success: response.success,
            data: response.body,
        })
    }

    /// [`RequestClient::call`] with a body serialized from `body`.
    pub async fn call_json<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        event_name: &str,
        body: &T,
    ) -> Result<Response> {
        let body = serde_json::to_string(body)?;
        self.call(subject, event_name, &body).await
    }

    /// Publish an event without waiting for a response.
    pub async fn publish(&self, subject: &str, event_name: &str, body: &str) -> Result<()> {
        let frame = encode_event(event_name, body)?;
        let connection = self.pool.pick()?;
        connection.publish(subject, None, frame).await?;
        debug!(connection = %connection.id(), subject = %subject, "Event published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_event, encode_response, EncodeError};
    use crate::subscription::{HandlerFuture, InboundMessage, SubscribeDeclaration};
    use crate::test_utils::{channel_pool, eventually, CountingHandler};
    use crate::transport::ChannelConnector;
    use std::sync::atomic::Ordering;

    /// Answers every event with its own body.
    fn echo_handler() -> Arc<dyn crate::subscription::MessageHandler> {
        Arc::new(|message: InboundMessage| -> HandlerFuture {
            Box::pin(async move {
                let event = decode_event(&message.payload)?;
                if let Some(reply_to) = message.reply_to.as_deref() {
                    let frame = encode_response(true, &event.body)?;
                    message.connection.publish(reply_to, None, frame).await?;
                }
                Ok(())
            })
        })
    }

    async fn echo_pool() -> (Arc<ChannelConnector>, Arc<ConnectionPool>) {
        let (connector, pool) = channel_pool(2).await;
        pool.register(echo_handler(), &SubscribeDeclaration::new("echo"))
            .await
            .unwrap();
        (connector, Arc::new(pool))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (_connector, pool) = echo_pool().await;
        let client = RequestClient::new(pool);

        let response = client.call("echo", "ping", r#"{"id":7}"#).await.unwrap();

        assert!(response.success);
        assert_eq!(response.data, r#"{"id":7}"#);
    }

    #[tokio::test]
    async fn test_call_json_and_response_json() {
        let (_connector, pool) = echo_pool().await;
        let client = RequestClient::new(pool);

        let response = client
            .call_json("echo", "ping", &serde_json::json!({ "qty": 3 }))
            .await
            .unwrap();
        let value: serde_json::Value = response.json().unwrap();

        assert_eq!(value["qty"], 3);
    }

    #[tokio::test]
    async fn test_call_timeout_releases_inbox() {
        let (connector, pool) = channel_pool(1).await;
        let before = connector.broker().subscription_count();
        let client = RequestClient::new(Arc::new(pool));

        let result = client
            .call_with_timeout("nobody.home", "ping", "", Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(Error::RequestTimeout(_))));
        assert_eq!(connector.broker().subscription_count(), before);
    }

    #[tokio::test]
    async fn test_call_default_timeout_is_configurable() {
        let (_connector, pool) = channel_pool(1).await;
        let client =
            RequestClient::new(Arc::new(pool)).with_default_timeout(Duration::from_millis(20));

        let result = client.call("nobody.home", "ping", "").await;

        assert!(matches!(result, Err(Error::RequestTimeout(t)) if t == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_call_rejects_oversized_event_name() {
        let (connector, pool) = channel_pool(1).await;
        let client = RequestClient::new(Arc::new(pool));
        let name = "x".repeat(256);

        let result = client.call("echo", &name, "").await;

        assert!(matches!(
            result,
            Err(Error::Encoding(EncodeError::EventNameTooLong { len: 256 }))
        ));
        // Nothing was subscribed or sent
        assert_eq!(connector.broker().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_call_on_empty_pool_is_exhausted() {
        let (connector, _) = channel_pool(0).await;
        let pool = ConnectionPool::from_connections(connector, Vec::new());
        let client = RequestClient::new(Arc::new(pool));

        let result = client.call("echo", "ping", "").await;

        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_call_on_closed_connection_fails() {
        let (_connector, pool) = channel_pool(1).await;
        pool.pick().unwrap().close().await;
        let client = RequestClient::new(Arc::new(pool));

        let result = client.call("echo", "ping", "").await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_publish_is_fire_and_forget() {
        let (_connector, pool) = channel_pool(1).await;
        let handler = CountingHandler::new();
        let count = handler.count();
        pool.register(Arc::new(handler), &SubscribeDeclaration::new("audit"))
            .await
            .unwrap();
        let client = RequestClient::new(Arc::new(pool));

        client.publish("audit", "login", "{}").await.unwrap();

        assert!(eventually(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 1).await);
    }
}
