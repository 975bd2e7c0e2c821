//! Signaling wire format
//!
//! Messages are flat JSON objects with a `type` discriminator. Builders emit
//! the canonical shapes; [`parse_message`] accepts any object so the router
//! can forward fields it does not understand.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::SignalingError;
use crate::nat::IceCandidate;

/// A parsed signaling message
pub type Message = Map<String, Value>;

/// Fields that may name the recipient, highest priority first
pub const TARGET_FIELDS: [&str; 4] = ["callee_id", "target_user_id", "receiver_id", "caller_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    CallInit,
    CallOffer,
    CallAnswer,
    CallIceCandidate,
    CallEnd,
    CallError,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CallInit => "call_init",
            MessageType::CallOffer => "call_offer",
            MessageType::CallAnswer => "call_answer",
            MessageType::CallIceCandidate => "call_ice_candidate",
            MessageType::CallEnd => "call_end",
            MessageType::CallError => "call_error",
        }
    }

    /// Fields that must be present for the message to be well formed
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            MessageType::CallInit => &["caller_id", "callee_id"],
            MessageType::CallOffer => &["caller_id", "callee_id", "offer"],
            // The callee's replies carry only `caller_id`, see [`reply_to_caller`]
            MessageType::CallAnswer => &["caller_id", "answer"],
            MessageType::CallEnd => &["caller_id"],
            MessageType::CallIceCandidate => &["candidate"],
            MessageType::CallError => &["error_code"],
        }
    }

    /// Whether this message starts a call and needs authorization
    pub fn opens_call(&self) -> bool {
        matches!(self, MessageType::CallInit | MessageType::CallOffer)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call_init" => Ok(MessageType::CallInit),
            "call_offer" => Ok(MessageType::CallOffer),
            "call_answer" => Ok(MessageType::CallAnswer),
            "call_ice_candidate" => Ok(MessageType::CallIceCandidate),
            "call_end" => Ok(MessageType::CallEnd),
            "call_error" => Ok(MessageType::CallError),
            other => Err(SignalingError::Malformed(format!("unknown message type: {other}"))),
        }
    }
}

/// Closed set of signaling error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FeatureLocked,
    InvalidToken,
    UserNotFound,
    UserOffline,
    InvalidMessage,
    CallInProgress,
    PermissionDenied,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::FeatureLocked,
        ErrorCode::InvalidToken,
        ErrorCode::UserNotFound,
        ErrorCode::UserOffline,
        ErrorCode::InvalidMessage,
        ErrorCode::CallInProgress,
        ErrorCode::PermissionDenied,
    ];

    /// Numeric code on the wire
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::FeatureLocked => 1001,
            ErrorCode::InvalidToken => 1002,
            ErrorCode::UserNotFound => 1003,
            ErrorCode::UserOffline => 1004,
            ErrorCode::InvalidMessage => 1005,
            ErrorCode::CallInProgress => 1006,
            ErrorCode::PermissionDenied => 1007,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FeatureLocked => "feature-locked",
            ErrorCode::InvalidToken => "invalid-token",
            ErrorCode::UserNotFound => "user-not-found",
            ErrorCode::UserOffline => "user-offline",
            ErrorCode::InvalidMessage => "invalid-message",
            ErrorCode::CallInProgress => "call-in-progress",
            ErrorCode::PermissionDenied => "permission-denied",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::FeatureLocked => "Voice calls are not available for this account",
            ErrorCode::InvalidToken => "Authentication failed",
            ErrorCode::UserNotFound => "User not found",
            ErrorCode::UserOffline => "User is offline",
            ErrorCode::InvalidMessage => "Malformed message",
            ErrorCode::CallInProgress => "Another call is in progress",
            ErrorCode::PermissionDenied => "Permission denied",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn create_call_init(caller_id: &str, callee_id: &str, call_type: &str) -> String {
    json!({
        "type": MessageType::CallInit.as_str(),
        "caller_id": caller_id,
        "callee_id": callee_id,
        "call_type": call_type,
        "timestamp": unix_timestamp(),
    })
    .to_string()
}

pub fn create_call_offer(caller_id: &str, callee_id: &str, offer_sdp: &str) -> String {
    json!({
        "type": MessageType::CallOffer.as_str(),
        "caller_id": caller_id,
        "callee_id": callee_id,
        "offer": offer_sdp,
        "timestamp": unix_timestamp(),
    })
    .to_string()
}

pub fn create_call_answer(caller_id: &str, callee_id: &str, answer_sdp: &str) -> String {
    json!({
        "type": MessageType::CallAnswer.as_str(),
        "caller_id": caller_id,
        "callee_id": callee_id,
        "answer": answer_sdp,
        "timestamp": unix_timestamp(),
    })
    .to_string()
}

pub fn create_call_ice_candidate(caller_id: &str, callee_id: &str, candidate: &IceCandidate) -> String {
    json!({
        "type": MessageType::CallIceCandidate.as_str(),
        "caller_id": caller_id,
        "callee_id": callee_id,
        "candidate": candidate.candidate,
        "sdp_mline_index": candidate.sdp_mline_index,
        "sdp_mid": candidate.sdp_mid,
        "timestamp": unix_timestamp(),
    })
    .to_string()
}

pub fn create_call_end(caller_id: &str, callee_id: &str, reason: &str) -> String {
    json!({
        "type": MessageType::CallEnd.as_str(),
        "caller_id": caller_id,
        "callee_id": callee_id,
        "reason": reason,
        "timestamp": unix_timestamp(),
    })
    .to_string()
}

pub fn create_error(code: ErrorCode, message: &str, context: Option<&str>) -> String {
    let mut value = json!({
        "type": MessageType::CallError.as_str(),
        "error_code": code.code(),
        "error": code.as_str(),
        "error_message": message,
        "timestamp": unix_timestamp(),
    });
    if let (Some(context), Some(object)) = (context.filter(|c| !c.is_empty()), value.as_object_mut()) {
        object.insert("context".into(), Value::String(context.to_string()));
    }
    value.to_string()
}

/// Parse a JSON object. Anything else is malformed.
pub fn parse_message(json: &str) -> Result<Message, SignalingError> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(message)) => Ok(message),
        Ok(_) => Err(SignalingError::Malformed("expected a JSON object".into())),
        Err(e) => Err(SignalingError::Malformed(e.to_string())),
    }
}

pub fn message_type(message: &Message) -> Option<MessageType> {
    message.get("type")?.as_str()?.parse().ok()
}

/// Check the declared type and that its required fields are present.
/// Field contents are not inspected.
pub fn validate_message(message: &Message, expected: MessageType) -> bool {
    if message_type(message) != Some(expected) {
        return false;
    }
    expected
        .required_fields()
        .iter()
        .all(|field| message.get(*field).map(|v| !v.is_null()).unwrap_or(false))
}

/// String value of a field, accepting numbers for ids
pub fn field_str(message: &Message, field: &str) -> Option<String> {
    match message.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The user a message is addressed to
pub fn extract_target_user(message: &Message) -> Option<String> {
    TARGET_FIELDS.iter().find_map(|field| field_str(message, field))
}

/// Drop `callee_id` from a message the callee sends, so that routing
/// falls through to `caller_id`.
pub fn reply_to_caller(json: &str) -> String {
    match parse_message(json) {
        Ok(mut message) => {
            message.remove("callee_id");
            Value::Object(message).to_string()
        }
        Err(_) => json.to_string(),
    }
}

/// Typed view of a signaling message for endpoints
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    CallInit {
        caller_id: String,
        callee_id: String,
        #[serde(default = "default_call_type")]
        call_type: String,
    },
    CallOffer {
        caller_id: String,
        callee_id: String,
        offer: String,
    },
    CallAnswer {
        caller_id: String,
        #[serde(default)]
        callee_id: String,
        answer: String,
    },
    CallIceCandidate {
        #[serde(default)]
        caller_id: String,
        #[serde(default)]
        callee_id: String,
        candidate: String,
        #[serde(default)]
        sdp_mid: String,
        #[serde(default)]
        sdp_mline_index: u16,
    },
    CallEnd {
        caller_id: String,
        #[serde(default)]
        callee_id: String,
        #[serde(default = "default_end_reason")]
        reason: String,
    },
    CallError {
        error_code: u16,
        #[serde(default)]
        error_message: String,
        #[serde(default)]
        context: Option<String>,
    },
}

fn default_call_type() -> String {
    "audio".into()
}

fn default_end_reason() -> String {
    "user_ended".into()
}

impl SignalingMessage {
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SignalingMessage::CallInit { .. } => MessageType::CallInit,
            SignalingMessage::CallOffer { .. } => MessageType::CallOffer,
            SignalingMessage::CallAnswer { .. } => MessageType::CallAnswer,
            SignalingMessage::CallIceCandidate { .. } => MessageType::CallIceCandidate,
            SignalingMessage::CallEnd { .. } => MessageType::CallEnd,
            SignalingMessage::CallError { .. } => MessageType::CallError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_validate() {
        let cases = [
            (create_call_init("a", "b", "audio"), MessageType::CallInit),
            (create_call_offer("a", "b", "v=0"), MessageType::CallOffer),
            (create_call_answer("a", "b", "v=0"), MessageType::CallAnswer),
            (
                create_call_ice_candidate("a", "b", &IceCandidate::new("candidate:1", "0", 0)),
                MessageType::CallIceCandidate,
            ),
            (create_call_end("a", "b", "user_ended"), MessageType::CallEnd),
            (create_error(ErrorCode::UserOffline, "gone", None), MessageType::CallError),
        ];

        for (json, kind) in cases {
            let message = parse_message(&json).unwrap();
            assert!(validate_message(&message, kind), "{kind} failed: {json}");
            assert!(message.get("timestamp").and_then(Value::as_i64).is_some());
        }
    }

    #[test]
    fn test_validate_checks_type_and_fields() {
        let offer = parse_message(&create_call_offer("a", "b", "sdp")).unwrap();
        assert!(!validate_message(&offer, MessageType::CallAnswer));

        let missing_sdp = parse_message(r#"{"type":"call_offer","caller_id":"a","callee_id":"b"}"#).unwrap();
        assert!(!validate_message(&missing_sdp, MessageType::CallOffer));

        // Content is not inspected
        let junk_sdp = parse_message(r#"{"type":"call_answer","caller_id":"a","callee_id":"b","answer":"junk"}"#).unwrap();
        assert!(validate_message(&junk_sdp, MessageType::CallAnswer));

        let untyped = parse_message(r#"{"caller_id":"a"}"#).unwrap();
        assert!(!validate_message(&untyped, MessageType::CallInit));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse_message("[1,2]").is_err());
        assert!(parse_message("not json").is_err());
        assert!(parse_message("{}").is_ok());
    }

    #[test]
    fn test_escaping() {
        let json = create_call_end("a\"b", "c\\d", "line\nbreak");
        let message = parse_message(&json).unwrap();
        assert_eq!(message["caller_id"], "a\"b");
        assert_eq!(message["reason"], "line\nbreak");
    }

    #[test]
    fn test_target_priority() {
        let message = parse_message(
            r#"{"type":"call_answer","caller_id":"1","receiver_id":"3","target_user_id":"2"}"#,
        )
        .unwrap();
        assert_eq!(extract_target_user(&message).as_deref(), Some("2"));

        let message = parse_message(r#"{"type":"call_answer","caller_id":"1"}"#).unwrap();
        assert_eq!(extract_target_user(&message).as_deref(), Some("1"));

        let message = parse_message(r#"{"type":"call_end","callee_id":42}"#).unwrap();
        assert_eq!(extract_target_user(&message).as_deref(), Some("42"));

        let message = parse_message(r#"{"type":"call_end","callee_id":""}"#).unwrap();
        assert_eq!(extract_target_user(&message), None);
    }

    #[test]
    fn test_first_target_field_wins() {
        let message = parse_message(
            r#"{"type":"call_init","caller_id":"bob","callee_id":"carol","target_user_id":"alice"}"#,
        )
        .unwrap();
        assert_eq!(extract_target_user(&message).as_deref(), Some("carol"));

        // An answer built with both ids still names the callee first
        let answer = parse_message(&create_call_answer("alice", "bob", "v=0")).unwrap();
        assert_eq!(extract_target_user(&answer).as_deref(), Some("bob"));
    }

    #[test]
    fn test_callee_reply_targets_caller() {
        let reply = parse_message(&reply_to_caller(&create_call_answer("alice", "bob", "v=0"))).unwrap();
        assert!(reply.get("callee_id").is_none());
        assert_eq!(extract_target_user(&reply).as_deref(), Some("alice"));
        assert!(validate_message(&reply, MessageType::CallAnswer));

        let end = parse_message(&reply_to_caller(&create_call_end("alice", "bob", "declined"))).unwrap();
        assert!(validate_message(&end, MessageType::CallEnd));

        let typed = SignalingMessage::from_json(&reply_to_caller(&create_call_answer("alice", "bob", "v=0"))).unwrap();
        assert_eq!(typed.message_type(), MessageType::CallAnswer);

        assert_eq!(reply_to_caller("not json"), "not json");
    }

    #[test]
    fn test_error_codes() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);

        let json = create_error(ErrorCode::CallInProgress, "busy", Some("call_offer"));
        let message = parse_message(&json).unwrap();
        assert_eq!(message["error_code"], 1006);
        assert_eq!(message["error"], "call-in-progress");
        assert_eq!(message["context"], "call_offer");
    }

    #[test]
    fn test_typed_view() {
        let json = create_call_ice_candidate("a", "b", &IceCandidate::new("candidate:9", "audio", 1));
        match SignalingMessage::from_json(&json).unwrap() {
            SignalingMessage::CallIceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                assert_eq!(candidate, "candidate:9");
                assert_eq!(sdp_mid, "audio");
                assert_eq!(sdp_mline_index, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let end = SignalingMessage::from_json(r#"{"type":"call_end","caller_id":"a","callee_id":"b","from_user_id":"a"}"#).unwrap();
        assert_eq!(end.message_type(), MessageType::CallEnd);
    }
}
