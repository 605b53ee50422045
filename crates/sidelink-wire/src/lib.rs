//! Frames exchanged with the sidecar over the session WebSocket.
//!
//! A frame is a JSON object `{ "headers": {..}, "body": {..} }`. The shape of
//! `body` is determined by `headers.message_type`, so the envelope is decoded
//! in two steps: headers first, then the body for that type. Encoding and
//! decoding never accept a body that disagrees with its declared type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use sidelink_types::ConnectionEvent;

/// Soft ceiling on the serialized body of an outbound frame.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("body does not match message type {message_type}: {source}")]
    BodyMismatch {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    AccessRequest,
    AccessResponse,
    Hello,
    WorkspaceHello,
    WorkspaceCountChanged,
    ConnectionEvent,
    ProtocolError,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::AccessRequest,
        MessageType::AccessResponse,
        MessageType::Hello,
        MessageType::WorkspaceHello,
        MessageType::WorkspaceCountChanged,
        MessageType::ConnectionEvent,
        MessageType::ProtocolError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AccessRequest => "ACCESS_REQUEST",
            MessageType::AccessResponse => "ACCESS_RESPONSE",
            MessageType::Hello => "HELLO",
            MessageType::WorkspaceHello => "WORKSPACE_HELLO",
            MessageType::WorkspaceCountChanged => "WORKSPACE_COUNT_CHANGED",
            MessageType::ConnectionEvent => "CONNECTION_EVENT",
            MessageType::ProtocolError => "PROTOCOL_ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a frame is meant for: the sidecar itself or every sibling workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Sidecar,
    Workspaces,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeaders {
    pub originator: String,
    pub message_id: String,
    pub message_type: MessageType,
    pub audience: Audience,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequestBody {
    pub access_token: String,
}

impl fmt::Debug for AccessRequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRequestBody")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessResponseBody {
    pub authorized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloBody {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceCountChangedBody {
    pub current_workspace_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

/// Frame payload, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    AccessRequest(AccessRequestBody),
    AccessResponse(AccessResponseBody),
    Hello(HelloBody),
    WorkspaceHello(HelloBody),
    WorkspaceCountChanged(WorkspaceCountChangedBody),
    ConnectionEvent(ConnectionEvent),
    ProtocolError(ProtocolErrorBody),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::AccessRequest(_) => MessageType::AccessRequest,
            MessageBody::AccessResponse(_) => MessageType::AccessResponse,
            MessageBody::Hello(_) => MessageType::Hello,
            MessageBody::WorkspaceHello(_) => MessageType::WorkspaceHello,
            MessageBody::WorkspaceCountChanged(_) => MessageType::WorkspaceCountChanged,
            MessageBody::ConnectionEvent(_) => MessageType::ConnectionEvent,
            MessageBody::ProtocolError(_) => MessageType::ProtocolError,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            MessageBody::AccessRequest(body) => serde_json::to_value(body),
            MessageBody::AccessResponse(body) => serde_json::to_value(body),
            MessageBody::Hello(body) | MessageBody::WorkspaceHello(body) => {
                serde_json::to_value(body)
            }
            MessageBody::WorkspaceCountChanged(body) => serde_json::to_value(body),
            MessageBody::ConnectionEvent(body) => serde_json::to_value(body),
            MessageBody::ProtocolError(body) => serde_json::to_value(body),
        }
    }

    pub fn from_value(message_type: MessageType, value: Value) -> Result<Self, WireError> {
        let mismatch = |source| WireError::BodyMismatch {
            message_type,
            source,
        };
        let body = match message_type {
            MessageType::AccessRequest => {
                MessageBody::AccessRequest(serde_json::from_value(value).map_err(mismatch)?)
            }
            MessageType::AccessResponse => {
                MessageBody::AccessResponse(serde_json::from_value(value).map_err(mismatch)?)
            }
            MessageType::Hello => MessageBody::Hello(serde_json::from_value(value).map_err(mismatch)?),
            MessageType::WorkspaceHello => {
                MessageBody::WorkspaceHello(serde_json::from_value(value).map_err(mismatch)?)
            }
            MessageType::WorkspaceCountChanged => MessageBody::WorkspaceCountChanged(
                serde_json::from_value(value).map_err(mismatch)?,
            ),
            MessageType::ConnectionEvent => {
                MessageBody::ConnectionEvent(serde_json::from_value(value).map_err(mismatch)?)
            }
            MessageType::ProtocolError => {
                MessageBody::ProtocolError(serde_json::from_value(value).map_err(mismatch)?)
            }
        };
        Ok(body)
    }
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
    headers: MessageHeaders,
    body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub headers: MessageHeaders,
    pub body: MessageBody,
}

impl Message {
    /// Build an outbound frame with a fresh message id. The header's
    /// `message_type` always follows the body.
    pub fn new(originator: impl Into<String>, audience: Audience, body: MessageBody) -> Self {
        Self {
            headers: MessageHeaders {
                originator: originator.into(),
                message_id: Uuid::new_v4().to_string(),
                message_type: body.message_type(),
                audience,
            },
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.headers.message_type
    }

    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let raw: RawMessage = serde_json::from_str(raw).map_err(WireError::Malformed)?;
        let body = MessageBody::from_value(raw.headers.message_type, raw.body)?;
        Ok(Self {
            headers: raw.headers,
            body,
        })
    }

    /// Serialize the frame, refusing bodies larger than `max_payload_bytes`.
    pub fn encode(&self, max_payload_bytes: usize) -> Result<String, WireError> {
        let body = self.body.to_value().map_err(WireError::Malformed)?;
        let body_len = serde_json::to_string(&body)
            .map_err(WireError::Malformed)?
            .len();
        if body_len > max_payload_bytes {
            return Err(WireError::PayloadTooLarge {
                size: body_len,
                limit: max_payload_bytes,
            });
        }
        let mut headers = self.headers.clone();
        headers.message_type = self.body.message_type();
        serde_json::to_string(&RawMessage { headers, body }).map_err(WireError::Malformed)
    }
}
