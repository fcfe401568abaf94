//! Per-connection event handling.
//!
//! A [`Session`] is what one socket knows about itself: its id, the room and
//! username it joined with, and the queue its outbound events go through.
//! Who is in a room is the store's business, not the session's.

use tokio::{
    sync::{broadcast::{self, error::RecvError}, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    AppState,
    db::{Departure, JOIN_HISTORY_LIMIT},
    events::{ClientEvent, ServerEvent},
    groups::Envelope,
};

struct Joined {
    room_id: String,
    username: String,
    forward: JoinHandle<()>,
}

pub struct Session {
    id: Uuid,
    outbox: mpsc::UnboundedSender<ServerEvent>,
    joined: Option<Joined>,
}

impl Session {
    pub fn new(outbox: mpsc::UnboundedSender<ServerEvent>) -> Session {
        Session {
            id: Uuid::now_v7(),
            outbox,
            joined: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `(room_id, username)` this connection joined with, if any.
    pub fn joined(&self) -> Option<(&str, &str)> {
        self.joined
            .as_ref()
            .map(|joined| (joined.room_id.as_str(), joined.username.as_str()))
    }

    /// Handles one inbound text frame. Frames that do not validate are
    /// answered with an `error` event and go no further.
    pub async fn handle_frame(&mut self, app_state: &AppState, frame: &str) {
        match ClientEvent::parse(frame) {
            Ok(event) => self.dispatch(app_state, event).await,
            Err(err) => {
                warn!(session = %self.id, "rejected frame: {err}");
                self.reply(err.into());
            }
        }
    }

    pub async fn dispatch(&mut self, app_state: &AppState, event: ClientEvent) {
        use ClientEvent::*;
        match event {
            JoinRoom { room_id, username } => self.join_room(app_state, room_id, username).await,
            SendMessage { room_id, sender, text } => self.send_message(app_state, &room_id, &sender, &text).await,
            Typing { room_id, username, is_typing } => self.typing(app_state, &room_id, username, is_typing),
            ClearRoomChat { room_id } => self.clear_room_chat(app_state, &room_id).await,
        }
    }

    async fn join_room(&mut self, app_state: &AppState, room_id: String, username: String) {
        let rebinding = match &self.joined {
            Some(joined) => joined.room_id != room_id || joined.username != username,
            None => false,
        };
        if rebinding {
            self.leave(app_state).await;
        }

        let joined = async {
            let messages = app_state.store.recent_messages(&room_id, JOIN_HISTORY_LIMIT).await?;
            let room = app_state.store.join_room(&room_id, &username).await?;
            Ok::<_, sqlx::Error>((room, messages))
        };
        let (room, messages) = match joined.await {
            Ok(joined) => joined,
            Err(err) => {
                error!(session = %self.id, %room_id, %username, "join failed: {err}");
                self.reply(ServerEvent::error("Failed to join room"));
                return;
            }
        };

        // subscribe before replying so nothing sent from here on is missed,
        // but only start forwarding once room-joined is queued
        let rx = self.joined.is_none().then(|| app_state.groups.subscribe(&room_id));

        info!(session = %self.id, %room_id, %username, "joined room");

        self.reply(ServerEvent::RoomJoined {
            room_id: room_id.clone(),
            participants: room.participants.clone(),
            messages,
        });

        if let Some(rx) = rx {
            let forward = self.forward(rx);
            self.joined = Some(Joined {
                room_id: room_id.clone(),
                username: username.clone(),
                forward,
            });
        }

        app_state.groups.emit_except(
            &room_id,
            self.id,
            ServerEvent::UserJoined { username, participants: room.participants },
        );
    }

    async fn send_message(&mut self, app_state: &AppState, room_id: &str, sender: &str, text: &str) {
        match app_state.store.insert_message(room_id, sender, text).await {
            Ok(message) => {
                debug!(session = %self.id, %room_id, id = %message.id, "message stored");
                app_state.groups.emit(room_id, ServerEvent::NewMessage(message));
            }
            Err(err) => {
                error!(session = %self.id, %room_id, "send failed: {err}");
                self.reply(ServerEvent::error("Failed to send message"));
            }
        }
    }

    fn typing(&self, app_state: &AppState, room_id: &str, username: String, is_typing: bool) {
        app_state
            .groups
            .emit_except(room_id, self.id, ServerEvent::UserTyping { username, is_typing });
    }

    async fn clear_room_chat(&mut self, app_state: &AppState, room_id: &str) {
        match app_state.store.clear_messages(room_id).await {
            Ok(removed) => {
                info!(session = %self.id, %room_id, removed, "room chat cleared");
                app_state.groups.emit(room_id, ServerEvent::RoomChatCleared {});
            }
            Err(err) => {
                error!(session = %self.id, %room_id, "clear failed: {err}");
                self.reply(ServerEvent::error("Failed to clear chat"));
            }
        }
    }

    /// Ends the session, taking the user out of whatever room they joined.
    pub async fn disconnect(mut self, app_state: &AppState) {
        self.leave(app_state).await;
        debug!(session = %self.id, "session closed");
    }

    /// Nobody is left to tell when this fails, so errors are only logged.
    async fn leave(&mut self, app_state: &AppState) {
        let Some(Joined { room_id, username, forward }) = self.joined.take() else {
            return;
        };
        forward.abort();
        // the task owns the room receiver; wait until it is dropped
        let _ = forward.await;

        match app_state.store.leave_room(&room_id, &username).await {
            Ok(Departure::Remaining(room)) => {
                info!(session = %self.id, %room_id, %username, "left room");
                app_state.groups.emit(
                    &room_id,
                    ServerEvent::UserLeft { username, participants: room.participants },
                );
            }
            Ok(Departure::Deleted) => {
                info!(session = %self.id, %room_id, %username, "left room, room deleted");
            }
            Ok(Departure::Missing) => {
                debug!(session = %self.id, %room_id, "room already gone");
            }
            Err(err) => {
                error!(session = %self.id, %room_id, %username, "leave failed: {err}");
            }
        }

        app_state.groups.prune(&room_id);
    }

    fn reply(&self, event: ServerEvent) {
        if self.outbox.send(event).is_err() {
            debug!(session = %self.id, "outbox closed, dropping reply");
        }
    }

    /// Pumps the room's broadcasts into this session's outbox.
    fn forward(&self, mut rx: broadcast::Receiver<Envelope>) -> JoinHandle<()> {
        let id = self.id;
        let outbox = self.outbox.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.is_for(id) && outbox.send(envelope.event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = %id, skipped, "session fell behind its room");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(joined) = &self.joined {
            joined.forward.abort();
        }
    }
}
