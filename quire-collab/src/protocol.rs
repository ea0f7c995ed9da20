//! JSON wire protocol for page collaboration.
//!
//! Every frame, in both directions, is one envelope:
//! ```text
//! { "type": string, "data": object, "user_id"?: string, "page_id"?: string }
//! ```
//!
//! Clients may only send `page_update`, `cursor_position`, `typing_start`
//! and `typing_stop`. Everything else is produced by the hub.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// Message types of the collaboration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Page content changed (live edit or persisted mutation)
    PageUpdate,
    /// Caret/selection position of a participant
    CursorPosition,
    TypingStart,
    TypingStop,
    /// A comment was persisted by the host application
    CommentAdded,
    /// Presence: someone joined the page
    UserJoined,
    /// Presence: someone left the page
    UserLeft,
    /// Private snapshot of the page's current participants
    PageUsers,
}

impl MessageType {
    /// Exact, case-sensitive lookup of a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "page_update" => Some(Self::PageUpdate),
            "cursor_position" => Some(Self::CursorPosition),
            "typing_start" => Some(Self::TypingStart),
            "typing_stop" => Some(Self::TypingStop),
            "comment_added" => Some(Self::CommentAdded),
            "user_joined" => Some(Self::UserJoined),
            "user_left" => Some(Self::UserLeft),
            "page_users" => Some(Self::PageUsers),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageUpdate => "page_update",
            Self::CursorPosition => "cursor_position",
            Self::TypingStart => "typing_start",
            Self::TypingStop => "typing_stop",
            Self::CommentAdded => "comment_added",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::PageUsers => "page_users",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// The wire unit. Built fresh for every broadcast and never mutated once
/// encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
}

/// Current time as an RFC 3339 UTC string.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Envelope {
    fn new(msg_type: MessageType, data: Value) -> Self {
        Self {
            msg_type,
            data: object(data),
            user_id: None,
            page_id: None,
        }
    }

    fn tagged(mut self, user: &UserIdentity, page_id: &str) -> Self {
        self.user_id = Some(user.user_id.clone());
        self.page_id = Some(page_id.to_string());
        self
    }

    /// Content update, either relayed from a live editor or issued after a
    /// persisted mutation.
    pub fn page_update(page_id: &str, content: &str, author: &UserIdentity) -> Self {
        Self::new(
            MessageType::PageUpdate,
            json!({
                "page_id": page_id,
                "content": content,
                "user_id": author.user_id,
                "username": author.username,
                "timestamp": timestamp(),
            }),
        )
        .tagged(author, page_id)
    }

    pub fn cursor_position(page_id: &str, position: Value, author: &UserIdentity) -> Self {
        Self::new(
            MessageType::CursorPosition,
            json!({
                "user_id": author.user_id,
                "username": author.username,
                "position": position,
                "timestamp": timestamp(),
            }),
        )
        .tagged(author, page_id)
    }

    /// `typing_start` or `typing_stop`, depending on `started`.
    pub fn typing(page_id: &str, started: bool, author: &UserIdentity) -> Self {
        let msg_type = if started {
            MessageType::TypingStart
        } else {
            MessageType::TypingStop
        };
        Self::new(
            msg_type,
            json!({
                "user_id": author.user_id,
                "username": author.username,
            }),
        )
        .tagged(author, page_id)
    }

    pub fn comment_added(
        page_id: &str,
        comment_id: &str,
        content: &str,
        author: &UserIdentity,
    ) -> Self {
        Self::new(
            MessageType::CommentAdded,
            json!({
                "comment_id": comment_id,
                "page_id": page_id,
                "content": content,
                "user_id": author.user_id,
                "username": author.username,
                "timestamp": timestamp(),
            }),
        )
        .tagged(author, page_id)
    }

    pub fn user_joined(page_id: &str, user: &UserIdentity) -> Self {
        Self::new(
            MessageType::UserJoined,
            json!({
                "user_id": user.user_id,
                "username": user.username,
                "message": format!("{} joined the page", user.username),
            }),
        )
        .tagged(user, page_id)
    }

    pub fn user_left(page_id: &str, user: &UserIdentity) -> Self {
        Self::new(
            MessageType::UserLeft,
            json!({
                "user_id": user.user_id,
                "username": user.username,
                "message": format!("{} left the page", user.username),
            }),
        )
        .tagged(user, page_id)
    }

    /// Snapshot of the page's participants, one entry per live connection.
    pub fn page_users(page_id: &str, users: &[UserIdentity]) -> Self {
        let mut envelope = Self::new(MessageType::PageUsers, json!({ "users": users }));
        envelope.page_id = Some(page_id.to_string());
        envelope
    }

    /// JSON text of the envelope. Built from `Value`s, so it cannot fail.
    pub fn encode(&self) -> String {
        let mut frame = Map::new();
        frame.insert("type".into(), Value::from(self.msg_type.as_str()));
        frame.insert("data".into(), Value::Object(self.data.clone()));
        if let Some(user_id) = &self.user_id {
            frame.insert("user_id".into(), Value::from(user_id.as_str()));
        }
        if let Some(page_id) = &self.page_id {
            frame.insert("page_id".into(), Value::from(page_id.as_str()));
        }
        Value::Object(frame).to_string()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// String field of `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Loose inbound shape: the type stays a string so that unknown types can
/// be told apart from unparseable frames.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// A validated client-originated frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    PageUpdate { content: String },
    CursorPosition { position: Value },
    TypingStart,
    TypingStop,
}

impl ClientFrame {
    /// Parse a text frame received from a client.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let msg_type = MessageType::from_wire(&raw.msg_type)
            .ok_or_else(|| ProtocolError::UnknownType(raw.msg_type.clone()))?;
        let data = raw.data.unwrap_or_default();

        match msg_type {
            MessageType::PageUpdate => {
                let content = data
                    .get("content")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField {
                        msg_type: "page_update",
                        field: "content",
                    })?;
                Ok(Self::PageUpdate {
                    content: content.to_string(),
                })
            }
            MessageType::CursorPosition => {
                let position = data
                    .get("position")
                    .filter(|v| !v.is_null())
                    .cloned()
                    .ok_or(ProtocolError::MissingField {
                        msg_type: "cursor_position",
                        field: "position",
                    })?;
                Ok(Self::CursorPosition { position })
            }
            MessageType::TypingStart => Ok(Self::TypingStart),
            MessageType::TypingStop => Ok(Self::TypingStop),
            other => Err(ProtocolError::NotClientOriginated(other.to_string())),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::PageUpdate { .. } => MessageType::PageUpdate,
            Self::CursorPosition { .. } => MessageType::CursorPosition,
            Self::TypingStart => MessageType::TypingStart,
            Self::TypingStop => MessageType::TypingStop,
        }
    }
}
