//! Inbound event dispatch.
//!
//! An [`EventDispatcher`] is the handler bound to each event subject. It
//! decodes the event frame, routes it to the [`EventProcessor`] registered
//! for the event type, and answers on the reply address when the sender
//! asked for one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_event, encode_response};
use crate::error::{Error, HandlerError, Result};
use crate::subscription::{HandlerFuture, InboundMessage, MessageHandler};
use crate::transport::Connection;

/// Application logic for one event type.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Event type string this processor answers to.
    fn event_type(&self) -> &str;

    /// Process an event body (JSON, possibly empty).
    ///
    /// The returned string is sent back as a successful response. An error's
    /// message is sent back as a failed one.
    async fn handle(
        &self,
        body: &str,
        connection: Arc<dyn Connection>,
    ) -> std::result::Result<String, HandlerError>;
}

/// Table of event processors keyed by event type.
///
/// Built once at startup and read-only afterwards.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn EventProcessor>>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    /// Processor registered for an event type.
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventProcessor>> {
        self.processors.get(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Builder for [`ProcessorRegistry`].
#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: HashMap<String, Arc<dyn EventProcessor>>,
    duplicate: Option<String>,
}

impl ProcessorRegistryBuilder {
    pub fn register(self, processor: impl EventProcessor + 'static) -> Self {
        self.register_arc(Arc::new(processor))
    }

    pub fn register_arc(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        let event_type = processor.event_type().to_string();
        if self.processors.contains_key(&event_type) {
            self.duplicate.get_or_insert(event_type);
            return self;
        }
        info!(event_type = %event_type, "Discovered event processor");
        self.processors.insert(event_type, processor);
        self
    }

    /// Finish the table. Fails if two processors claimed one event type.
    pub fn build(self) -> Result<ProcessorRegistry> {
        if let Some(event_type) = self.duplicate {
            return Err(Error::DuplicateEventType(event_type));
        }
        Ok(ProcessorRegistry {
            processors: self.processors,
        })
    }
}

/// Outcome of dispatching one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A response frame was published to the reply address.
    Replied { success: bool },
    /// No reply address; the outcome was logged and discarded.
    Completed { success: bool },
}

impl DispatchResult {
    /// Returns true if the processor succeeded.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Replied { success: true } | Self::Completed { success: true }
        )
    }
}

/// Routes inbound event frames to registered processors.
#[derive(Clone)]
pub struct EventDispatcher {
    processors: Arc<ProcessorRegistry>,
}

impl EventDispatcher {
    pub fn new(processors: Arc<ProcessorRegistry>) -> Self {
        Self { processors }
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    /// Handle one inbound message.
    ///
    /// Malformed frames fail without a reply. An unknown event type is
    /// answered with a failure response when a reply address is present and
    /// fails otherwise. Processor errors and panics become failure responses.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<DispatchResult> {
        let frame = decode_event(&message.payload)?;
        let reply_to = message.reply_to.as_deref().filter(|r| !r.is_empty());

        let Some(processor) = self.processors.get(&frame.event_name).cloned() else {
            let err = Error::UnknownEventType(frame.event_name);
            let Some(reply_to) = reply_to else {
                return Err(err);
            };
            warn!(subject = %message.subject, error = %err, "Answering unknown event type with failure");
            reply(message.connection.as_ref(), reply_to, false, &err.to_string()).await?;
            return Ok(DispatchResult::Replied { success: false });
        };

        let invocation = processor.handle(&frame.body, Arc::clone(&message.connection));
        let (success, body) = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(response)) => (true, response),
            Ok(Err(e)) => {
                error!(event_type = %frame.event_name, error = %e, "Event processor failed");
                (false, e.to_string())
            }
            Err(_) => {
                error!(event_type = %frame.event_name, "Event processor panicked");
                (false, format!("event processor for '{}' panicked", frame.event_name))
            }
        };

        match reply_to {
            Some(reply_to) => {
                reply(message.connection.as_ref(), reply_to, success, &body).await?;
                Ok(DispatchResult::Replied { success })
            }
            None => {
                debug!(
                    event_type = %frame.event_name,
                    success,
                    "No reply address, discarding outcome"
                );
                Ok(DispatchResult::Completed { success })
            }
        }
    }
}

impl MessageHandler for EventDispatcher {
    fn handle(&self, message: InboundMessage) -> HandlerFuture {
        let dispatcher = self.clone();
        Box::pin(async move {
            dispatcher
                .dispatch(message)
                .await
                .map(|_| ())
                .map_err(HandlerError::from)
        })
    }
}

async fn reply(
    connection: &dyn Connection,
    reply_to: &str,
    success: bool,
    body: &str,
) -> Result<()> {
    let frame = encode_response(success, body)?;
    connection.publish(reply_to, None, frame).await?;
    Ok(())
}
