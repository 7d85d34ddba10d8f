//! Trigger payloads delivered by the event dispatcher.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies the object that was created or finalized.
///
/// Unknown fields are ignored, so a full object-finalize notification body
/// deserializes into this as well.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub bucket: String,
    pub name: String,
}

impl StorageEvent {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }
}

/// A Pub/Sub push delivery wrapping a storage notification.
#[derive(Deserialize, Debug)]
pub struct PushEnvelope {
    pub message: PushMessage,
}

#[derive(Deserialize, Debug)]
pub struct PushMessage {
    /// Base64-encoded JSON object notification.
    pub data: String,
}

/// Any payload accepted on the trigger endpoint.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum TriggerPayload {
    Push(PushEnvelope),
    Direct(StorageEvent),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("push message data is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("push message data is not a storage notification: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("storage notification is missing the {0}")]
    Missing(&'static str),
}

impl TriggerPayload {
    /// Unwrap the payload into the event it carries.
    pub fn into_event(self) -> Result<StorageEvent, EventError> {
        let event = match self {
            TriggerPayload::Direct(event) => event,
            TriggerPayload::Push(envelope) => {
                let raw = general_purpose::STANDARD.decode(envelope.message.data.trim())?;
                serde_json::from_slice(&raw)?
            }
        };
        if event.bucket.is_empty() {
            return Err(EventError::Missing("bucket"));
        }
        if event.name.is_empty() {
            return Err(EventError::Missing("object name"));
        }
        Ok(event)
    }
}
