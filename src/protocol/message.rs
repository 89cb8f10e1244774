//! Request/response vocabulary carried inside frames.
//!
//! Requests are maps tagged by `type`, responses are maps tagged by
//! `status`:
//!
//! ```text
//! {type: "get_object"}                      → {status: "success", payload: <object>}
//!                                           → {status: "error", message: "..."}
//! {type: "shutdown"}                        → {status: "success", message: "Server shutting down"}
//! ```

use serde::de::{self, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, ShareError};

/// Message returned for a `get_object` that arrives before the object exists.
pub const NOT_INITIALIZED_MESSAGE: &str = "Shared object not initialized";

/// Message attached to the `shutdown` acknowledgement.
pub const SHUTDOWN_MESSAGE: &str = "Server shutting down";

/// Request kinds understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ask for a serialized copy of the shared object.
    GetObject,
    /// Stop accepting connections.
    Shutdown,
}

impl Request {
    /// Wire name of this request kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetObject => "get_object",
            Request::Shutdown => "shutdown",
        }
    }
}

/// The `type` field of an inbound request, as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// A string name, known or not.
    Name(String),
    /// Any non-string value (number, map, ...). Encodes as nil.
    NotAString,
}

impl Serialize for RequestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RequestKind::Name(name) => serializer.serialize_str(name),
            RequestKind::NotAString => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Other(IgnoredAny),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => RequestKind::Name(name),
            Raw::Other(_) => RequestKind::NotAString,
        })
    }
}

/// Permissive decoding target for inbound requests.
///
/// Decoding into the envelope only fails on malformed MsgPack, so a well-formed
/// map with a missing, non-string or unknown `type` can still be answered with
/// an error response instead of dropping the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type", default)]
    pub kind: Option<RequestKind>,
}

impl RequestEnvelope {
    /// Envelope with the given `type` field.
    pub fn with_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(RequestKind::Name(kind.into())),
        }
    }
}

impl TryFrom<RequestEnvelope> for Request {
    type Error = ShareError;

    fn try_from(envelope: RequestEnvelope) -> Result<Self> {
        match envelope.kind {
            Some(RequestKind::Name(name)) => match name.as_str() {
                // `get_pipeline` is the name older clients send.
                "get_object" | "get_pipeline" => Ok(Request::GetObject),
                "shutdown" => Ok(Request::Shutdown),
                other => Err(ShareError::Protocol(format!(
                    "Unknown request type: {}",
                    other
                ))),
            },
            Some(RequestKind::NotAString) => Err(ShareError::Protocol(
                "Invalid request type: expected a string".to_string(),
            )),
            None => Err(ShareError::Protocol(
                "Missing required field: type".to_string(),
            )),
        }
    }
}

/// Server response, generic over the object payload.
///
/// The server sends `Response<Arc<O>>` and the client reads `Response<O>`;
/// both produce the same map on the wire.
///
/// Decoding reads the map field by field into `ResponseFields`, so the
/// payload is built straight from the stream without buffering the whole
/// message first, whatever the key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<O> {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<O>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Status {
    Success,
    Error,
}

/// Flat view of a response map.
#[derive(Deserialize)]
struct ResponseFields<O> {
    status: Status,
    payload: Option<O>,
    message: Option<String>,
}

impl<'de, O> Deserialize<'de> for Response<O>
where
    O: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let fields = ResponseFields::<O>::deserialize(deserializer)?;
        match fields.status {
            Status::Success => Ok(Response::Success {
                payload: fields.payload,
                message: fields.message,
            }),
            Status::Error => fields
                .message
                .map(|message| Response::Error { message })
                .ok_or_else(|| de::Error::missing_field("message")),
        }
    }
}

impl<O> Response<O> {
    /// Success carrying the object.
    pub fn object(payload: O) -> Self {
        Response::Success {
            payload: Some(payload),
            message: None,
        }
    }

    /// Success carrying only a message.
    pub fn ack(message: impl Into<String>) -> Self {
        Response::Success {
            payload: None,
            message: Some(message.into()),
        }
    }

    /// Error response.
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    /// Check for `status: success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    /// Convert into the carried object.
    ///
    /// An error response becomes [`ShareError::Server`]; a success without a
    /// payload is a protocol error.
    pub fn into_payload(self) -> Result<O> {
        match self {
            Response::Success {
                payload: Some(payload),
                ..
            } => Ok(payload),
            Response::Success { payload: None, .. } => Err(ShareError::Protocol(
                "Success response carries no payload".to_string(),
            )),
            Response::Error { message } => Err(ShareError::Server(message)),
        }
    }
}
