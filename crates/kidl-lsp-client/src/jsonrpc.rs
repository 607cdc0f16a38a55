//! JSON-RPC 2.0 message model used on the language server channel.
//!
//! Inbound payloads are classified by shape: an object with a `method` and an
//! `id` is a request, a `method` without an `id` is a notification, and an
//! object carrying `result`, `error` or a bare `id` is a response.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC and LSP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32_700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32_600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32_601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32_602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32_603;
    /// A request arrived before `initialize`.
    pub const SERVER_NOT_INITIALIZED: i64 = -32_002;
    /// The request was cancelled by the client.
    pub const REQUEST_CANCELLED: i64 = -32_800;
    /// The document changed while the request was being served.
    pub const CONTENT_MODIFIED: i64 = -32_801;
}

/// Identifier correlating a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier; the client always allocates these.
    Number(i64),
    /// String identifier, accepted from servers.
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self, MessageError> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Number).ok_or_else(|| {
                MessageError::InvalidField {
                    field: "id",
                    reason: format!("{number} is not an integer"),
                }
            }),
            Value::String(text) => Ok(Self::String(text)),
            other => Err(MessageError::InvalidField {
                field: "id",
                reason: format!("expected a number or string, found {other}"),
            }),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(formatter, "{number}"),
            Self::String(text) => write!(formatter, "\"{text}\""),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates an error object without additional data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Error returned for methods the client does not serve.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method '{method}' is not supported by the client"),
        )
    }
}

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation identifier.
    pub id: RequestId,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    pub params: Option<Value>,
}

/// A fire-and-forget message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    pub params: Option<Value>,
}

/// Reply to a [`Request`].
///
/// Exactly one of `result` and `error` is populated on decoded responses; a
/// success without a `result` member decodes as `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request being answered; `None` when the peer could
    /// not read the request id.
    pub id: Option<RequestId>,
    /// Result on success.
    pub result: Option<Value>,
    /// Error on failure.
    pub error: Option<JsonRpcError>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    #[must_use]
    pub fn err(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the response into its outcome.
    ///
    /// # Errors
    ///
    /// Returns the server's error object when the response carries one.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Any message exchanged on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request, from either peer.
    Request(Request),
    /// A response, from either peer.
    Response(Response),
    /// A notification, from either peer.
    Notification(Notification),
}

impl Message {
    /// Builds a request message.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Builds a notification message.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(request.method.as_str()),
            Self::Notification(notification) => Some(notification.method.as_str()),
            Self::Response(_) => None,
        }
    }

    /// Decodes a message from a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] when the payload is not JSON or not a
    /// JSON-RPC 2.0 object.
    pub fn from_slice(payload: &[u8]) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|error| MessageError::Json(error.to_string()))?;
        Self::from_value(value)
    }

    /// Classifies a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] when the value is not a JSON-RPC 2.0 object.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut object) = value else {
            return Err(MessageError::NotAnObject);
        };

        check_version(object.remove("jsonrpc"))?;

        let has_id = object.contains_key("id");
        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw_id) => Some(RequestId::from_value(raw_id)?),
        };
        let params = object.remove("params");

        match object.remove("method") {
            Some(Value::String(method)) => Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            }),
            Some(other) => Err(MessageError::InvalidField {
                field: "method",
                reason: format!("expected a string, found {other}"),
            }),
            None => decode_response(id, has_id, object),
        }
    }

    /// Encodes the message as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error when a parameter value cannot be encoded.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn check_version(version: Option<Value>) -> Result<(), MessageError> {
    match version {
        Some(Value::String(text)) if text == JSONRPC_VERSION => Ok(()),
        Some(other) => Err(MessageError::Version {
            found: other.to_string(),
        }),
        None => Err(MessageError::Version {
            found: "nothing".to_owned(),
        }),
    }
}

fn decode_response(
    id: Option<RequestId>,
    has_id: bool,
    mut object: Map<String, Value>,
) -> Result<Message, MessageError> {
    let error = match object.remove("error") {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::from_value::<JsonRpcError>(value).map_err(|error| {
            MessageError::InvalidField {
                field: "error",
                reason: error.to_string(),
            }
        })?),
    };
    let raw_result = object.remove("result");

    if error.is_none() && raw_result.is_none() && !has_id {
        return Err(MessageError::Unclassifiable);
    }

    let result = match error {
        Some(_) => None,
        None => Some(raw_result.unwrap_or(Value::Null)),
    };
    Ok(Message::Response(Response { id, result, error }))
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Notification(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Response(response) => {
                map.serialize_entry("id", &response.id)?;
                match &response.error {
                    Some(error) => map.serialize_entry("error", error)?,
                    None => map.serialize_entry(
                        "result",
                        response.result.as_ref().unwrap_or(&Value::Null),
                    )?,
                }
            }
        }
        map.end()
    }
}

/// Reasons a payload is not a usable JSON-RPC message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The payload is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    /// The payload is valid JSON but not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,
    /// The `jsonrpc` member is missing or not `"2.0"`.
    #[error("expected jsonrpc \"2.0\", found {found}")]
    Version {
        /// The value that was found.
        found: String,
    },
    /// A member has the wrong type.
    #[error("invalid `{field}` member: {reason}")]
    InvalidField {
        /// Offending member name.
        field: &'static str,
        /// Description of the problem.
        reason: String,
    },
    /// The object is neither a request, a notification nor a response.
    #[error("object is not a request, response or notification")]
    Unclassifiable,
}
