use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::ServerEvent;

/// Per-room buffer; a subscriber that falls further behind loses the oldest events.
pub const GROUP_CAPACITY: usize = 64;

/// One event fanned out to a room, optionally skipping the connection that caused it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub except: Option<Uuid>,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        self.except != Some(connection_id)
    }
}

/// Broadcast groups keyed by room id. Holds only the fan-out channels,
/// never connection state.
#[derive(Clone, Default)]
pub struct Groups {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl Groups {
    pub fn subscribe(&self, room_id: &str) -> broadcast::Receiver<Envelope> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Sends to every subscriber of the room.
    pub fn emit(&self, room_id: &str, event: ServerEvent) {
        self.send(room_id, Envelope { except: None, event });
    }

    /// Sends to every subscriber of the room but `connection_id`.
    pub fn emit_except(&self, room_id: &str, connection_id: Uuid, event: ServerEvent) {
        self.send(room_id, Envelope { except: Some(connection_id), event });
    }

    fn send(&self, room_id: &str, envelope: Envelope) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = rooms.get(room_id) else {
            return;
        };

        if tx.send(envelope).is_err() {
            // nobody is listening anymore
            rooms.remove(room_id);
        }
    }

    /// Drops the room's channel once nobody is subscribed to it.
    pub fn prune(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        if rooms.get(room_id).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room_id);
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(username: &str) -> ServerEvent {
        ServerEvent::UserTyping { username: username.into(), is_typing: true }
    }

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let groups = Groups::default();
        let mut a = groups.subscribe("r1");
        let mut b = groups.subscribe("r1");

        groups.emit("r1", ServerEvent::RoomChatCleared {});

        assert_eq!(a.recv().await.unwrap().event, ServerEvent::RoomChatCleared {});
        assert_eq!(b.recv().await.unwrap().event, ServerEvent::RoomChatCleared {});
    }

    #[tokio::test]
    async fn emit_except_marks_the_sender() {
        let groups = Groups::default();
        let mut rx = groups.subscribe("r1");
        let me = Uuid::now_v7();

        groups.emit_except("r1", me, typing("alice"));

        let envelope = rx.recv().await.unwrap();
        assert!(!envelope.is_for(me));
        assert!(envelope.is_for(Uuid::now_v7()));
    }

    #[tokio::test]
    async fn rooms_do_not_leak_into_each_other() {
        let groups = Groups::default();
        let mut r1 = groups.subscribe("r1");
        let _r2 = groups.subscribe("r2");

        groups.emit("r2", typing("bob"));

        assert!(r1.try_recv().is_err());
    }

    #[test]
    fn abandoned_groups_are_pruned() {
        let groups = Groups::default();
        drop(groups.subscribe("r1"));
        assert_eq!(groups.len(), 1);

        groups.emit("r1", typing("alice"));
        assert!(groups.is_empty());

        // emitting to a room nobody ever joined is fine too
        groups.emit("nowhere", typing("alice"));
        assert!(groups.is_empty());
    }

    #[test]
    fn prune_keeps_rooms_with_listeners() {
        let groups = Groups::default();
        let listening = groups.subscribe("r1");
        drop(groups.subscribe("r2"));

        groups.prune("r1");
        groups.prune("r2");
        groups.prune("nowhere");
        assert_eq!(groups.len(), 1);

        drop(listening);
        groups.prune("r1");
        assert!(groups.is_empty());
    }
}
