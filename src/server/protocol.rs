//! Protocol message definitions
//!
//! Defines the event envelope exchanged between chat clients and the relay, plus the
//! payload schemas for the event types the relay understands. All frames are JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound event: a client submits a chat message
pub const EVENT_SEND_MESSAGE: &str = "send_message";

/// Outbound event: a chat message fanned out to every client
pub const EVENT_NEW_MESSAGE: &str = "new_message";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Event type cannot be empty")]
    EmptyEventType,
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Event Envelope
// ============================================================================

/// Wire envelope wrapping every frame in both directions
///
/// The payload is kept opaque until a handler for `event_type` decodes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Discriminator selecting the payload schema and handler
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload, schema determined by `event_type`
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Build an event by encoding `payload` under the given type
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: &T) -> ProtocolResult<Self> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(ProtocolError::EmptyEventType);
        }

        Ok(Self {
            event_type,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse and validate an event from a text frame
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let event: Self = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    /// Parse and validate an event from a binary frame
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        let event: Self = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }

    /// Serialize the event to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload into the schema for this event's type
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    fn validate(&self) -> ProtocolResult<()> {
        if self.event_type.is_empty() {
            return Err(ProtocolError::EmptyEventType);
        }
        Ok(())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload of a `send_message` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    /// Display name of the author, taken as-is from the client
    pub from: String,
    /// Message body
    pub message: String,
}

/// Payload of a `new_message` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatBroadcast {
    pub from: String,
    pub message: String,
    /// Server-side time the message was relayed
    #[serde(rename = "sent")]
    pub sent_at: DateTime<Utc>,
}

impl ChatBroadcast {
    /// Stamp a request with the given send time
    pub fn stamped(request: ChatRequest, sent_at: DateTime<Utc>) -> Self {
        Self {
            from: request.from,
            message: request.message,
            sent_at,
        }
    }
}
