//! Wire protocol for the room socket.
//!
//! Every frame is a JSON text frame shaped `{"event": "<name>", "data": {...}}`,
//! in both directions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::Message;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom { room_id: String, username: String },
    SendMessage { room_id: String, sender: String, text: String },
    Typing { room_id: String, username: String, is_typing: bool },
    ClearRoomChat { room_id: String },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    RoomJoined {
        room_id: String,
        participants: Vec<String>,
        messages: Vec<Message>,
    },
    UserJoined { username: String, participants: Vec<String> },
    NewMessage(Message),
    UserTyping { username: String, is_typing: bool },
    RoomChatCleared {},
    UserLeft { username: String, participants: Vec<String> },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> ServerEvent {
        ServerEvent::Error { message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Invalid event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid event: {0} must not be empty")]
    EmptyField(&'static str),
}

impl From<EventError> for ServerEvent {
    fn from(err: EventError) -> ServerEvent {
        ServerEvent::error(err.to_string())
    }
}

impl ClientEvent {
    /// Parses a text frame and checks every required field is filled in.
    pub fn parse(frame: &str) -> Result<ClientEvent, EventError> {
        let event: ClientEvent = serde_json::from_str(frame)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventError> {
        use ClientEvent::*;
        let fields: Vec<(&'static str, &str)> = match self {
            JoinRoom { room_id, username } => vec![("roomId", room_id.as_str()), ("username", username.as_str())],
            SendMessage { room_id, sender, text } => vec![("roomId", room_id.as_str()), ("sender", sender.as_str()), ("text", text.as_str())],
            Typing { room_id, username, .. } => vec![("roomId", room_id.as_str()), ("username", username.as_str())],
            ClearRoomChat { room_id } => vec![("roomId", room_id.as_str())],
        };

        match fields.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(EventError::EmptyField(name)),
            None => Ok(()),
        }
    }
}
