use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Client -> Server
// ============================================================================

/// Frame sent by a client over an open chat connection.
///
/// Only the body is read. Any sender fields a client adds are ignored; the
/// server stamps identity from the authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub body: String,
}

impl ClientFrame {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// A chat message as relayed to every member of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Machine-readable code carried by chat error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed, empty or oversized frame. The frame is dropped, the connection stays open.
    ProtocolViolation,
    /// The sender no longer has access to the workspace. The connection is closed.
    Forbidden,
    /// The access token used for the handshake has expired. The connection is closed.
    AuthExpired,
    /// Unexpected server-side failure.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Error sent only to the connection that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: ErrorBody,
}

/// Any frame the server writes to a chat connection.
///
/// The two shapes are distinguished by their keys, so the enum is untagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message(ChatMessage),
    Error(ErrorFrame),
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            error: ErrorBody {
                code,
                message: message.into(),
            },
        })
    }
}

impl From<ChatMessage> for ServerFrame {
    fn from(message: ChatMessage) -> Self {
        Self::Message(message)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_wire_keys() {
        let sender_id = Uuid::new_v4();
        let msg = ServerFrame::from(ChatMessage {
            sender_id,
            sender_name: "Ada".to_string(),
            body: "hello team".to_string(),
            sent_at: Utc::now(),
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], sender_id.to_string());
        assert_eq!(json["senderName"], "Ada");
        assert_eq!(json["body"], "hello team");
        assert!(json["sentAt"].as_str().unwrap().contains('T'));
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::error(ErrorCode::ProtocolViolation, "Message body is empty");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"error":{"code":"PROTOCOL_VIOLATION","message":"Message body is empty"}}"#
        );
    }

    #[test]
    fn test_server_frame_untagged_decode() {
        let json = r#"{"error":{"code":"FORBIDDEN","message":"Access revoked"}}"#;
        match serde_json::from_str::<ServerFrame>(json).unwrap() {
            ServerFrame::Error(frame) => assert_eq!(frame.error.code, ErrorCode::Forbidden),
            _ => panic!("Expected Error variant"),
        }

        let json = r#"{"senderId":"1b4e28ba-2fa1-11d2-883f-0016d3cca427","senderName":"B","body":"hi","sentAt":"2026-01-01T00:00:00Z"}"#;
        match serde_json::from_str::<ServerFrame>(json).unwrap() {
            ServerFrame::Message(msg) => {
                assert_eq!(msg.body, "hi");
                assert_eq!(msg.sender_name, "B");
            }
            _ => panic!("Expected Message variant"),
        }
    }

    #[test]
    fn test_client_frame_ignores_sender_fields() {
        let json = r#"{"body":"hi","senderId":"spoofed","senderName":"Mallory"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.body, "hi");
    }

    #[test]
    fn test_client_frame_requires_body() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"text":"hi"}"#).is_err());
    }
}
