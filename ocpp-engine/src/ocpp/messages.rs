//! OCPP-J RPC message framing
//!
//! OCPP carries JSON arrays over WebSocket text frames:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::OcppError;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Action names this engine sends or handles.
///
/// Routing is by string, so peers may use actions outside this list;
/// they are answered with `NotImplemented` unless a handler is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    Authorize,
    TransactionEvent,

    // CSMS -> CP
    GetBaseReport,
    GetReport,
    RequestStartTransaction,
    RequestStopTransaction,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::Authorize => "Authorize",
            Action::TransactionEvent => "TransactionEvent",
            Action::GetBaseReport => "GetBaseReport",
            Action::GetReport => "GetReport",
            Action::RequestStartTransaction => "RequestStartTransaction",
            Action::RequestStopTransaction => "RequestStopTransaction",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

/// A frame that failed structural validation.
///
/// `message_id` is set only when the frame could still be answered with a
/// CALLERROR: it looked like a CALL (or carried an unknown type tag) and had
/// a string id. Broken CALLRESULT/CALLERROR frames are never answered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {reason}")]
pub struct DecodeError {
    pub message_id: Option<String>,
    pub code: ErrorCode,
    pub reason: String,
}

impl DecodeError {
    fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            message_id: None,
            code,
            reason: reason.into(),
        }
    }

    fn with_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// The CALLERROR to send back, if the frame can be answered at all.
    pub fn to_reply(&self) -> Option<CallError> {
        self.message_id
            .as_ref()
            .map(|id| CallError::new(id.clone(), self.code, self.reason.clone()))
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl From<Call> for Frame {
    fn from(call: Call) -> Self {
        Frame::Call(call)
    }
}

impl From<CallResult> for Frame {
    fn from(result: CallResult) -> Self {
        Frame::CallResult(result)
    }
}

impl From<CallError> for Frame {
    fn from(error: CallError) -> Self {
        Frame::CallError(error)
    }
}

impl Frame {
    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    /// Serialize to the OCPP-J wire text
    pub fn encode(&self) -> String {
        let array = match self {
            Frame::Call(c) => serde_json::json!([
                MessageType::Call as i32,
                &c.message_id,
                &c.action,
                &c.payload
            ]),
            Frame::CallResult(r) => serde_json::json!([
                MessageType::CallResult as i32,
                &r.message_id,
                &r.payload
            ]),
            Frame::CallError(e) => serde_json::json!([
                MessageType::CallError as i32,
                &e.message_id,
                e.error_code.to_string(),
                &e.error_description,
                &e.error_details
            ]),
        };
        array.to_string()
    }

    /// Parse an OCPP-J frame from wire text
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            DecodeError::new(ErrorCode::FormatViolation, format!("invalid JSON: {}", e))
        })?;

        let Value::Array(array) = value else {
            return Err(DecodeError::new(
                ErrorCode::FormatViolation,
                "frame is not a JSON array",
            ));
        };

        let tag = array.first().and_then(Value::as_i64);

        // Replies to our own calls are never answered, whatever their shape
        let answerable = !matches!(tag, Some(3) | Some(4));
        // Any string is a valid id, the empty one included
        let message_id = array.get(1).and_then(Value::as_str).map(str::to_string);
        let reply_id = if answerable { message_id.clone() } else { None };

        let Some(tag) = tag else {
            return Err(DecodeError::new(
                ErrorCode::MessageTypeNotSupported,
                "message type is not an integer",
            )
            .with_id(reply_id));
        };

        let Some(message_id) = message_id else {
            return Err(DecodeError::new(
                ErrorCode::ProtocolError,
                "message id missing or not a string",
            ));
        };

        match tag {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(DecodeError::new(
                        ErrorCode::FormatViolation,
                        format!("CALL needs 4 elements, got {}", array.len()),
                    )
                    .with_id(reply_id));
                }

                let action = array[2]
                    .as_str()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| {
                        DecodeError::new(
                            ErrorCode::ProtocolError,
                            "action missing or not a non-empty string",
                        )
                        .with_id(reply_id.clone())
                    })?
                    .to_string();

                Ok(Frame::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(DecodeError::new(
                        ErrorCode::FormatViolation,
                        format!("CALLRESULT needs 3 elements, got {}", array.len()),
                    ));
                }

                Ok(Frame::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails?]
                if !(4..=5).contains(&array.len()) {
                    return Err(DecodeError::new(
                        ErrorCode::FormatViolation,
                        format!("CALLERROR needs 4 or 5 elements, got {}", array.len()),
                    ));
                }

                let error_code = array[2]
                    .as_str()
                    .and_then(|code| serde_json::from_value(Value::String(code.to_string())).ok())
                    .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                let error_details = array
                    .get(4)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

                Ok(Frame::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
            other => Err(DecodeError::new(
                ErrorCode::MessageTypeNotSupported,
                format!("unknown message type {}", other),
            )
            .with_id(reply_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Call::new(Action::Heartbeat, serde_json::json!({})).unwrap();
        let text = Frame::Call(call).encode();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;

        match Frame::decode(json).unwrap() {
            Frame::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;

        match Frame::decode(json).unwrap() {
            Frame::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;

        match Frame::decode(json).unwrap() {
            Frame::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_without_details() {
        let json = r#"[4, "msg-1", "SomethingNew", "odd"]"#;

        match Frame::decode(json).unwrap() {
            Frame::CallError(error) => {
                assert_eq!(error.error_code, ErrorCode::GenericError);
                assert_eq!(error.error_details, serde_json::json!({}));
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_wire_layout() {
        let error = CallError::new("42", ErrorCode::FormatViolation, "bad payload");
        let text = Frame::CallError(error).encode();
        assert_eq!(text, r#"[4,"42","FormatViolation","bad payload",{}]"#);
    }

    #[test]
    fn test_not_json_is_unanswerable() {
        let err = Frame::decode("not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatViolation);
        assert!(err.to_reply().is_none());
    }

    #[test]
    fn test_malformed_call_keeps_id() {
        let err = Frame::decode(r#"[2, "abc", "Heartbeat"]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatViolation);

        let reply = err.to_reply().expect("answerable");
        assert_eq!(reply.message_id, "abc");
    }

    #[test]
    fn test_empty_action_rejected() {
        let err = Frame::decode(r#"[2, "abc", "", {}]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert_eq!(err.message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unknown_type_is_answerable() {
        let err = Frame::decode(r#"[7, "abc", {}]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageTypeNotSupported);
        assert_eq!(err.message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_result_is_not_answered() {
        let err = Frame::decode(r#"[3, "abc"]"#).unwrap_err();
        assert!(err.to_reply().is_none());

        let err = Frame::decode(r#"[4, "abc", "GenericError"]"#).unwrap_err();
        assert!(err.to_reply().is_none());
    }

    #[test]
    fn test_missing_id_rejected() {
        let err = Frame::decode(r#"[2, 17, "Heartbeat", {}]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert!(err.message_id.is_none());
    }

    #[test]
    fn test_empty_id_round_trips() {
        let frame = Frame::CallResult(CallResult {
            message_id: String::new(),
            payload: serde_json::json!({}),
        });
        assert_eq!(Frame::decode(&frame.encode()), Ok(frame));

        let err = Frame::decode(r#"[2, "", "Heartbeat"]"#).unwrap_err();
        assert_eq!(err.message_id.as_deref(), Some(""));
    }
}
