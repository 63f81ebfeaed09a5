use std::{borrow::Cow, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize, de::Error as _};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(D::Error::custom(format!(
                "expect jsonrpc version {JSONRPC_VERSION}, got {version}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

pub type RequestId = NumberOrString;

impl NumberOrString {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(NumberOrString::Number),
            Value::String(string) => Some(NumberOrString::String(string.as_str().into())),
            _ => None,
        }
    }
}

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => Display::fmt(n, f),
            NumberOrString::String(s) => Display::fmt(s, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
}

/// Error information for JSON-RPC error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// The error type that occurred.
    pub code: ErrorCode,
    /// A short description of the error. The message SHOULD be limited to a concise single sentence.
    pub message: Cow<'static, str>,
    /// Additional information about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, None)
    }
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, None)
    }
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }
    pub fn invalid_params(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, None)
    }
    pub fn internal_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, None)
    }
}

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        }
    }
}

/// An error envelope. `id` serializes as `null` when the request id could not
/// be recovered (parse errors, invalid requests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

impl JsonRpcError {
    pub fn new(id: Option<RequestId>, error: ErrorData) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        }
    }
}

/// Anything the server answers on a delivery call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcReply {
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcReply {
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcReply::Response(response) => Some(&response.id),
            JsonRpcReply::Error(error) => error.id.as_ref(),
        }
    }
}

/// A single inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

/// A message that could not be classified, with whatever id could be salvaged.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

impl From<Rejection> for JsonRpcReply {
    fn from(rejection: Rejection) -> Self {
        JsonRpcReply::Error(JsonRpcError::new(rejection.id, rejection.error))
    }
}

impl JsonRpcMessage {
    /// Classify a decoded JSON value as a request, notification or client response.
    pub fn from_value(value: Value) -> Result<Self, Rejection> {
        let reject = |id: Option<RequestId>, message: &'static str| Rejection {
            id,
            error: ErrorData::invalid_request(message),
        };
        let Value::Object(mut object) = value else {
            return Err(reject(None, "message must be a JSON object"));
        };
        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => match RequestId::from_json(raw) {
                Some(id) => Some(id),
                None => return Err(reject(None, "id must be a string or an integer")),
            },
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(reject(id, "jsonrpc must be \"2.0\""));
        }

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(reject(id, "method must be a string"));
            };
            let params = match object.remove("params") {
                None | Some(Value::Null) => None,
                Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
                Some(_) => return Err(reject(id, "params must be an object or an array")),
            };
            return Ok(match id {
                Some(id) => JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: JsonRpcVersion2_0,
                    id,
                    method,
                    params,
                }),
                None => JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc: JsonRpcVersion2_0,
                    method,
                    params,
                }),
            });
        }

        match (id, object.remove("result"), object.remove("error")) {
            (Some(id), Some(result), None) => Ok(JsonRpcMessage::Response(JsonRpcResponse::new(
                id, result,
            ))),
            (id, None, Some(error)) => match serde_json::from_value::<ErrorData>(error) {
                Ok(error) => Ok(JsonRpcMessage::Error(JsonRpcError::new(id, error))),
                Err(_) => Err(reject(id, "malformed error object")),
            },
            (id, _, _) => Err(reject(
                id,
                "message is neither a request, a notification nor a response",
            )),
        }
    }
}
