//! JSON-RPC 2.0 envelope shared by the native channel and the cross-context
//! channel, plus the native messaging frame codec.
//!
//! Inbound data is untrusted until [`is_request`] or [`is_response`] accepts
//! it. Both predicates are total: every malformed shape maps to `false`.

use std::borrow::Cow;
use std::fmt;

use serde::de::{self, DeserializeOwned, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Largest frame a browser accepts from a native host.
pub const MAX_HOST_MESSAGE_BYTES: usize = 1024 * 1024;
/// Largest frame a browser hands to a native host.
pub const MAX_EXTENSION_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

const FRAME_HEADER_BYTES: usize = 4;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32000;
pub const HOST_UNAVAILABLE: i64 = -32001;

pub const INITIALIZE_METHOD: &str = "initialize";
pub const HOST_NOT_CONNECTED_MESSAGE: &str = "Native host is not connected";

// ============================================================================
// Validator
// ============================================================================

/// Returns true when `message` is a well-formed request or notification.
#[must_use]
pub fn is_request(message: &Value) -> bool {
    let Some(object) = versioned_object(message) else {
        return false;
    };
    if !object.get("method").is_some_and(Value::is_string) {
        return false;
    }
    if object.get("id").is_some_and(|id| !id.is_string()) {
        return false;
    }
    if object.get("params").is_some_and(|params| !is_structured(params)) {
        return false;
    }
    true
}

/// Returns true when `message` is a well-formed, correlated response carrying
/// exactly one of `result` or `error`.
#[must_use]
pub fn is_response(message: &Value) -> bool {
    let Some(object) = versioned_object(message) else {
        return false;
    };
    if !object.get("id").is_some_and(Value::is_string) {
        return false;
    }
    match (object.get("result"), object.get("error")) {
        (Some(result), None) => is_structured(result),
        (None, Some(error)) => is_error_object(error),
        _ => false,
    }
}

fn versioned_object(message: &Value) -> Option<&Map<String, Value>> {
    let object = message.as_object()?;
    (object.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION)).then_some(object)
}

fn is_structured(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

fn is_error_object(error: &Value) -> bool {
    let Some(object) = error.as_object() else {
        return false;
    };
    object.get("code").is_some_and(Value::is_i64)
        && object.get("message").is_some_and(Value::is_string)
}

// ============================================================================
// Envelope types
// ============================================================================

/// The literal `"jsonrpc": "2.0"` tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = Cow::<'de, str>::deserialize(deserializer)?;
        if tag == JSONRPC_VERSION {
            Ok(Self)
        } else {
            Err(de::Error::invalid_value(
                Unexpected::Str(&tag),
                &"the literal \"2.0\"",
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Version,
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Version,
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(4);
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        if let Some(id) = &self.id {
            object.insert("id".to_string(), Value::from(id.as_str()));
        }
        object.insert("method".to_string(), Value::from(self.method.as_str()));
        if let Some(params) = &self.params {
            object.insert("params".to_string(), params.clone());
        }
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn host_unavailable(message: impl Into<String>) -> Self {
        Self::new(HOST_UNAVAILABLE, message)
    }

    fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(3);
        object.insert("code".to_string(), Value::from(self.code));
        object.insert("message".to_string(), Value::from(self.message.as_str()));
        if let Some(data) = &self.data {
            object.insert("data".to_string(), data.clone());
        }
        Value::Object(object)
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

/// A correlated response. The outcome enum makes "both" and "neither"
/// unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: String,
    pub outcome: ResponseOutcome,
}

impl RpcResponse {
    #[must_use]
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Result(result),
        }
    }

    #[must_use]
    pub fn failure(id: impl Into<String>, error: RpcErrorObject) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Error(error),
        }
    }

    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Result(result) => Some(result),
            ResponseOutcome::Error(_) => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&RpcErrorObject> {
        match &self.outcome {
            ResponseOutcome::Result(_) => None,
            ResponseOutcome::Error(error) => Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match self.outcome {
            ResponseOutcome::Result(result) => Ok(result),
            ResponseOutcome::Error(error) => Err(error),
        }
    }

    /// Parses an untrusted value; `None` unless [`is_response`] holds.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        if !is_response(&value) {
            return None;
        }
        let Value::Object(mut object) = value else {
            return None;
        };
        let Some(Value::String(id)) = object.remove("id") else {
            return None;
        };
        let outcome = match object.remove("result") {
            Some(result) => ResponseOutcome::Result(result),
            None => ResponseOutcome::Error(serde_json::from_value(object.remove("error")?).ok()?),
        };
        Some(Self { id, outcome })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(3);
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        object.insert("id".to_string(), Value::from(self.id.as_str()));
        match &self.outcome {
            ResponseOutcome::Result(result) => {
                object.insert("result".to_string(), result.clone());
            }
            ResponseOutcome::Error(error) => {
                object.insert("error".to_string(), error.to_value());
            }
        }
        Value::Object(object)
    }
}

impl Serialize for RpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RpcResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).ok_or_else(|| de::Error::custom("malformed JSON-RPC response"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl RpcMessage {
    /// Classifies untrusted input. Malformed input yields `None`.
    #[must_use]
    pub fn classify(value: Value) -> Option<Self> {
        if is_request(&value) {
            serde_json::from_value(value).ok().map(Self::Request)
        } else {
            RpcResponse::from_value(value).map(Self::Response)
        }
    }
}

/// Params of the one-time `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub browser_id: String,
    pub version: String,
}

// ============================================================================
// Native messaging frames: u32 little-endian length, then UTF-8 JSON.
// ============================================================================

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("native message exceeds {max_bytes} bytes (got {frame_bytes})")]
    FrameTooLarge {
        frame_bytes: usize,
        max_bytes: usize,
    },
    #[error("invalid JSON native message: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub fn encode_frame<T: Serialize>(message: &T, max_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > max_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            frame_bytes: payload.len(),
            max_bytes,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameCodecError::FrameTooLarge {
        frame_bytes: payload.len(),
        max_bytes,
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Fails with [`FrameCodecError::FrameTooLarge`] when `message` would not
/// fit in one frame. Nothing is buffered.
pub fn ensure_frame_fits<T: Serialize + ?Sized>(
    message: &T,
    max_bytes: usize,
) -> Result<(), FrameCodecError> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, message)?;
    if counter.0 > max_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            frame_bytes: counter.0,
            max_bytes,
        });
    }
    Ok(())
}

struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Decodes one frame from the front of `input`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete frame, otherwise
/// the decoded message and the number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(
    input: &[u8],
    max_bytes: usize,
) -> Result<Option<(T, usize)>, FrameCodecError> {
    let frame_len = match frame_length(input) {
        Some(len) => len,
        None => return Ok(None),
    };
    if frame_len > max_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            frame_bytes: frame_len,
            max_bytes,
        });
    }
    let Some(payload) = input.get(FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + frame_len) else {
        return Ok(None);
    };
    let decoded = serde_json::from_slice::<T>(payload)?;
    Ok(Some((decoded, FRAME_HEADER_BYTES + frame_len)))
}

/// Reads the length prefix, if the header is complete.
#[must_use]
pub fn frame_length(input: &[u8]) -> Option<usize> {
    let header = input.get(..FRAME_HEADER_BYTES)?;
    let mut bytes = [0_u8; FRAME_HEADER_BYTES];
    bytes.copy_from_slice(header);
    Some(u32::from_le_bytes(bytes) as usize)
}
