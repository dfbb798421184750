//! Event routing
//!
//! Maps event type discriminators to handlers. A router is filled in during setup and
//! then shared behind an `Arc`, so lookups need no locking.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use super::client::Client;
use super::handler::{HandlerError, SendMessageHandler};
use super::protocol::{Event, EVENT_SEND_MESSAGE};

/// Errors that can occur while routing an event
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Result type for routing operations
pub type RouteResult<T> = Result<T, RouteError>;

/// Handles one type of inbound event
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event received from `client`
    async fn handle(&self, event: &Event, client: &Client) -> Result<(), HandlerError>;
}

/// Table of event handlers keyed by event type
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Box<dyn EventHandler>>,
}

impl Router {
    /// Create a router with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a router with the relay's built-in handlers
    pub fn with_default_handlers() -> Self {
        let mut router = Self::new();
        router.register(EVENT_SEND_MESSAGE, SendMessageHandler);
        router
    }

    /// Bind a handler to an event type, replacing any previous binding
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) {
        self.handlers.insert(event_type.into(), Box::new(handler));
    }

    /// Invoke the handler bound to the event's type
    pub async fn dispatch(&self, event: &Event, client: &Client) -> RouteResult<()> {
        let handler = self
            .handlers
            .get(&event.event_type)
            .ok_or_else(|| RouteError::UnsupportedEventType(event.event_type.clone()))?;

        handler.handle(event, client).await?;
        Ok(())
    }
}
