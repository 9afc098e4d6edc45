//! Wire protocol for the real-time channel. Tag values are the event names
//! clients subscribe to, so they are part of the public contract.

use serde::{Deserialize, Serialize};

use crate::policy::Role;

/// Messages sent from client to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "call:join")]
    Join {
        call_id: String,
        #[serde(default)]
        anonymized: bool,
    },
    #[serde(rename = "call:leave")]
    Leave { call_id: String },
    /// Session offer, forwarded verbatim to the room (or a named target).
    #[serde(rename = "call:offer")]
    Offer {
        call_id: String,
        #[serde(default)]
        target_user_id: Option<String>,
        description: serde_json::Value,
    },
    #[serde(rename = "call:answer")]
    Answer {
        call_id: String,
        #[serde(default)]
        target_user_id: Option<String>,
        description: serde_json::Value,
    },
    #[serde(rename = "call:ice")]
    Ice {
        call_id: String,
        #[serde(default)]
        target_user_id: Option<String>,
        candidate: serde_json::Value,
    },
    /// Privacy-flag update; no re-authorization.
    #[serde(rename = "call:meta")]
    Meta { call_id: String, anonymized: bool },
    /// Out-of-room invitation to one user's personal channel.
    #[serde(rename = "call:ring")]
    Ring {
        call_id: String,
        target_user_id: String,
    },
    /// Ring every authorized identity for the call except the sender.
    #[serde(rename = "call:ring-app")]
    RingApp { call_id: String },
    #[serde(rename = "code:update")]
    CodeUpdate {
        call_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "wb:stroke")]
    WbStroke {
        call_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "wb:clear")]
    WbClear { call_id: String },
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reply to a successful join: who is already in the room.
    #[serde(rename = "call:participants")]
    Participants {
        call_id: String,
        members: Vec<ParticipantInfo>,
    },
    #[serde(rename = "call:peer-joined")]
    PeerJoined {
        call_id: String,
        user_id: String,
        role: Role,
        anonymized: bool,
    },
    #[serde(rename = "call:peer-left")]
    PeerLeft { call_id: String, user_id: String },
    #[serde(rename = "call:offer")]
    Offer {
        call_id: String,
        from: String,
        description: serde_json::Value,
    },
    #[serde(rename = "call:answer")]
    Answer {
        call_id: String,
        from: String,
        description: serde_json::Value,
    },
    #[serde(rename = "call:ice")]
    Ice {
        call_id: String,
        from: String,
        candidate: serde_json::Value,
    },
    #[serde(rename = "call:meta")]
    Meta {
        call_id: String,
        user_id: String,
        anonymized: bool,
    },
    #[serde(rename = "call:ring")]
    Ring { call_id: String, from: String },
    #[serde(rename = "code:update")]
    CodeUpdate {
        call_id: String,
        from: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "wb:stroke")]
    WbStroke {
        call_id: String,
        from: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "wb:clear")]
    WbClear { call_id: String, from: String },
    #[serde(rename = "call:error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        reason: String,
    },
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub role: Role,
    pub anonymized: bool,
}

/// Broadcast domain for a call.
pub fn call_room(call_id: &str) -> String {
    format!("call:{call_id}")
}

/// Personal notification channel; carries rings for a user who has not yet
/// joined any room.
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tags_are_event_names() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"call:join","call_id":"app-1"}"#).expect("parse ok");
        let ClientMessage::Join {
            call_id,
            anonymized,
        } = msg
        else {
            panic!("expected join");
        };
        assert_eq!(call_id, "app-1");
        assert!(!anonymized);
    }

    #[test]
    fn server_error_omits_absent_call_id() {
        let json = serde_json::to_string(&ServerMessage::Error {
            call_id: None,
            reason: "forbidden".into(),
        })
        .expect("serialize ok");
        assert_eq!(json, r#"{"type":"call:error","reason":"forbidden"}"#);
    }

    #[test]
    fn signaling_payload_round_trips_verbatim() {
        let original = r#"{"type":"call:offer","call_id":"app-1","description":{"sdp":"v=0...","kind":"offer"}}"#;
        let msg: ClientMessage = serde_json::from_str(original).expect("parse ok");
        let ClientMessage::Offer {
            description,
            target_user_id,
            ..
        } = msg
        else {
            panic!("expected offer");
        };
        assert!(target_user_id.is_none());
        assert_eq!(description["sdp"], "v=0...");
    }

    #[test]
    fn room_names_are_deterministic() {
        assert_eq!(call_room("app-1"), "call:app-1");
        assert_eq!(user_room("alice"), "user:alice");
    }
}
