//! Event handlers
//!
//! The relay's built-in handlers. `send_message` is stamped with the server time and
//! fanned out to every connected client, the sender included.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use super::client::Client;
use super::protocol::{ChatBroadcast, ChatRequest, Event, ProtocolError, EVENT_NEW_MESSAGE};
use super::router::EventHandler;

/// Errors reported by event handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Bad payload in request: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Failed to encode broadcast: {0}")]
    Encode(#[from] ProtocolError),

    #[error("Client registry is no longer available")]
    RegistryUnavailable,
}

/// Relays chat messages to every connected client
#[derive(Debug, Clone, Copy, Default)]
pub struct SendMessageHandler;

#[async_trait]
impl EventHandler for SendMessageHandler {
    async fn handle(&self, event: &Event, client: &Client) -> Result<(), HandlerError> {
        let request: ChatRequest = event
            .decode_payload()
            .map_err(HandlerError::MalformedPayload)?;

        let broadcast = ChatBroadcast::stamped(request, Utc::now());
        let outgoing = Event::new(EVENT_NEW_MESSAGE, &broadcast)?;

        let manager = client.manager().ok_or(HandlerError::RegistryUnavailable)?;
        let delivered = manager.broadcast(&outgoing).await;
        debug!(
            "Relayed message from {:?} (client {}) to {} clients",
            broadcast.from,
            client.id(),
            delivered
        );

        Ok(())
    }
}
