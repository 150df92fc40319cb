//! Line-delimited JSON protocol
//!
//! Each request is one JSON object per line, tagged by `type`. Each response
//! is `{"type": ..., "payload": {...}}` on its own line. See [`server`] for
//! the read loop.

use crate::core::db::{CancelOutcome, QueryFailure, QueryResult, QuerySuccess};
use crate::core::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod server;

pub use server::Server;

/// Request types understood by the server.
pub const REQUEST_TYPES: [&str; 5] = ["CONNECT", "EXECUTE", "RECONNECT", "CANCEL", "CLOSE"];

/// Incoming request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Connect {
        #[serde(default)]
        dsn: Option<String>,
    },
    Execute {
        sql: String,
        #[serde(rename = "resultSetId", default)]
        result_set_id: String,
        #[serde(rename = "maxRows", default)]
        max_rows: Option<usize>,
    },
    Reconnect {},
    Cancel {
        #[serde(rename = "resultSetId", default)]
        result_set_id: Option<String>,
    },
    Close {},
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "CONNECT",
            Request::Execute { .. } => "EXECUTE",
            Request::Reconnect {} => "RECONNECT",
            Request::Cancel { .. } => "CANCEL",
            Request::Close {} => "CLOSE",
        }
    }
}

/// A request line that could not be accepted.
#[derive(Debug)]
pub struct Rejected {
    /// Always `BridgeError::Protocol`
    pub error: BridgeError,
    /// The line's `resultSetId`, when it carried one, so the reply can be correlated
    pub result_set_id: Option<String>,
}

impl Rejected {
    pub fn new(message: String, result_set_id: Option<String>) -> Self {
        Rejected {
            error: BridgeError::Protocol(message),
            result_set_id,
        }
    }
}

/// Parses one request line.
///
/// # Errors
///
/// Rejects invalid JSON, an unknown `type`, or a known type with malformed
/// fields.
pub fn parse_request(line: &str) -> std::result::Result<Request, Rejected> {
    let value: JsonValue = serde_json::from_str(line)
        .map_err(|e| Rejected::new(format!("Invalid JSON: {}", e), None))?;
    let result_set_id = value
        .get("resultSetId")
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    let kind = match value.get("type") {
        Some(JsonValue::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    };
    if !REQUEST_TYPES.contains(&kind.as_str()) {
        return Err(Rejected::new(format!("Unknown command type: {}", kind), result_set_id));
    }

    serde_json::from_value(value)
        .map_err(|e| Rejected::new(format!("Invalid {} request: {}", kind, e), result_set_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Ready,
    ConnectResult,
    ExecuteResult,
    ReconnectResult,
    CancelResult,
    CloseResult,
    Error,
}

/// Outgoing response line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

/// Payload of CONNECT, RECONNECT, CANCEL, CLOSE and ERROR responses
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
}

impl StatusPayload {
    pub fn ok(message: impl Into<String>) -> Self {
        StatusPayload {
            success: true,
            message: Some(message.into()),
            ..StatusPayload::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        StatusPayload {
            success: false,
            error: Some(error.into()),
            ..StatusPayload::default()
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum ExecuteBody<'a> {
    Success(&'a QuerySuccess),
    Failure(&'a QueryFailure),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutePayload<'a> {
    success: bool,
    result_set_id: &'a str,
    #[serde(flatten)]
    body: ExecuteBody<'a>,
}

impl Response {
    pub fn ready() -> Self {
        Response {
            kind: ResponseKind::Ready,
            payload: None,
        }
    }

    pub fn status(kind: ResponseKind, payload: &StatusPayload) -> Result<Self> {
        Ok(Response {
            kind,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// EXECUTE_RESULT carrying `result_set_id` and the statement outcome.
    pub fn execute(result_set_id: &str, result: &QueryResult) -> Result<Self> {
        let (success, body) = match result {
            QueryResult::Success(success) => (true, ExecuteBody::Success(success)),
            QueryResult::Failure(failure) => (false, ExecuteBody::Failure(failure)),
        };
        let payload = ExecutePayload {
            success,
            result_set_id,
            body,
        };
        Ok(Response {
            kind: ResponseKind::ExecuteResult,
            payload: Some(serde_json::to_value(&payload)?),
        })
    }

    pub fn cancel(outcome: &CancelOutcome) -> Result<Self> {
        let message = match outcome {
            CancelOutcome::NotInFlight => "No matching query in flight".to_string(),
            CancelOutcome::Signalled { result_set_id, .. } => {
                format!("Cancellation requested for {}", result_set_id)
            }
        };
        let payload = StatusPayload {
            cancelled: Some(outcome.cancelled()),
            ..StatusPayload::ok(message)
        };
        Response::status(ResponseKind::CancelResult, &payload)
    }

    /// ERROR response for a request line that was rejected.
    pub fn rejected(rejected: &Rejected) -> Self {
        let message = match &rejected.error {
            BridgeError::Protocol(message) => message.clone(),
            other => other.to_string(),
        };
        let mut payload = serde_json::Map::new();
        payload.insert("success".to_string(), JsonValue::Bool(false));
        payload.insert("error".to_string(), JsonValue::String(message));
        if let Some(result_set_id) = &rejected.result_set_id {
            payload.insert("resultSetId".to_string(), JsonValue::String(result_set_id.clone()));
        }
        Response {
            kind: ResponseKind::Error,
            payload: Some(JsonValue::Object(payload)),
        }
    }
}
