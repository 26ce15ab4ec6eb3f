//! Wire protocol for client-facing WebSocket frames.
//!
//! Both directions are closed sum types dispatched by the `type` tag, so a
//! new message kind is a compile-checked addition rather than a stringly
//! match. All frames are JSON text; legacy raw-text status strings were
//! folded into the `status` variant.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a client may send over an open connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answer submission from a duel participant. Republished to the broker,
    /// never handled locally.
    Answer { data: Value },
    /// Application-level keepalive. Answered locally with `pong`; must not
    /// depend on broker availability.
    Ping,
}

/// Frames the relay sends to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after successful admission.
    Welcome { data: Value },
    /// A duel question pushed to every room participant.
    Question { data: Value },
    /// Duel status update (scores, progress).
    Status { data: Value },
    /// Terminal duel event with final results.
    DuelEnd { data: Value },
    /// Per-user notification delivered outside any room.
    Notification { data: Value },
    /// Reply to a client `ping`.
    Pong,
}

impl ServerMessage {
    /// Encode as a WebSocket text frame. `None` only if serialization fails,
    /// which for these variants means a non-serializable `Value` payload.
    pub fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_answer_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"answer","data":{"questionId":3,"choice":"b"}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Answer {
                data: json!({"questionId": 3, "choice": "b"})
            }
        );
    }

    #[test]
    fn client_ping_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"emote"}"#).is_err());
    }

    #[test]
    fn server_frames_are_tagged_json() {
        let frame = ServerMessage::Question {
            data: json!({"text": "?"}),
        };
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded, json!({"type": "question", "data": {"text": "?"}}));

        let pong = serde_json::to_value(&ServerMessage::Pong).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }
}
