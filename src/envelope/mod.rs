//! Envelope - the unit exchanged over a channel.
//!
//! An envelope is one of three shapes sharing a single struct:
//! - **Event**: `eventData`, no reply expected
//! - **Request**: `type` + `args`, answered by a Response with the same `messageId`
//! - **Response**: `result` on success, `error` on failure
//!
//! The presence of `error` marks a Response as failed regardless of the other
//! fields. Payloads are opaque JSON values passed through untouched.
//!
//! Envelopes travel inside a [`Frame`], which carries the channel tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::port::MessagePort;
use crate::types::{ClientId, MessageId};

pub mod enums;

pub use enums::*;

/// Correlated message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical operation name. Set on Requests and echoed on Responses.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    pub kind: MessageKind,

    pub message_id: MessageId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    fn bare(kind: MessageKind, message_id: MessageId) -> Self {
        Self {
            operation: None,
            kind,
            message_id,
            args: None,
            result: None,
            event_data: None,
            error: None,
        }
    }

    pub fn event(message_id: MessageId, data: Value) -> Self {
        Self {
            event_data: Some(data),
            ..Self::bare(MessageKind::Event, message_id)
        }
    }

    pub fn request(message_id: MessageId, operation: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            operation: Some(operation.into()),
            args: Some(args),
            ..Self::bare(MessageKind::Request, message_id)
        }
    }

    pub fn success(message_id: MessageId, operation: Option<String>, result: Value) -> Self {
        Self {
            operation,
            result: Some(result),
            ..Self::bare(MessageKind::Response, message_id)
        }
    }

    pub fn failure(
        message_id: MessageId,
        operation: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            error: Some(error.into()),
            ..Self::bare(MessageKind::Response, message_id)
        }
    }

    /// True when the `error` field is present.
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Control payload announcing a transferred channel, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClientPayload {
    pub client_id: ClientId,
}

/// One message on a raw transport: a channel tag plus its payload.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Ordinary envelope traffic.
    ServiceMessage(Envelope),
    /// A channel endpoint handed over for `client_id`.
    ServiceNewClient {
        client_id: ClientId,
        port: MessagePort,
    },
}

impl Frame {
    pub fn channel(&self) -> ChannelTag {
        match self {
            Frame::ServiceMessage(_) => ChannelTag::ServiceMessage,
            Frame::ServiceNewClient { .. } => ChannelTag::ServiceNewClient,
        }
    }

    /// The envelope, if this is ordinary traffic.
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Frame::ServiceMessage(envelope) => Some(envelope),
            Frame::ServiceNewClient { .. } => None,
        }
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::ServiceMessage(envelope)
    }
}
