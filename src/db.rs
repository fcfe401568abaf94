use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions, types::Json};
use time::OffsetDateTime;
use uuid::Uuid;

/// How many messages a joining client is handed.
pub const JOIN_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub participants: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: String,
    pub sender: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Outcome of taking a participant out of a room.
#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    /// There was no such room.
    Missing,
    /// The last participant left; the room record is gone.
    Deleted,
    Remaining(Room),
}

#[derive(sqlx::FromRow)]
struct RoomRow {
    room_id: String,
    participants: Json<Vec<String>>,
    created_at: i64,
}

impl TryFrom<RoomRow> for Room {
    type Error = sqlx::Error;

    fn try_from(RoomRow { room_id, participants, created_at }: RoomRow) -> sqlx::Result<Room> {
        Ok(Room {
            room_id,
            participants: participants.0,
            created_at: from_millis(created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    room_id: String,
    sender: String,
    text: String,
    timestamp: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = sqlx::Error;

    fn try_from(MessageRow { id, room_id, sender, text, timestamp }: MessageRow) -> sqlx::Result<Message> {
        Ok(Message {
            id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(e.into()))?,
            room_id,
            sender,
            text,
            timestamp: from_millis(timestamp)?,
        })
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> sqlx::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

/// Current time at the precision the store keeps.
fn now() -> OffsetDateTime {
    let at = OffsetDateTime::now_utc();
    at.replace_millisecond(at.millisecond()).unwrap_or(at)
}

fn collect<R, T>(rows: Vec<R>) -> sqlx::Result<Vec<T>>
where
    T: TryFrom<R, Error = sqlx::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Rooms and messages, persisted in SQLite.
#[derive(Clone)]
pub struct Store {
    db_pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> sqlx::Result<Store> {
        // an in-memory database lives and dies with its one connection
        let options = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        };

        let db_pool = options.connect(url).await?;
        sqlx::migrate!().run(&db_pool).await?;

        Ok(Store { db_pool })
    }

    pub async fn close(&self) {
        self.db_pool.close().await;
    }

    pub async fn find_room(&self, room_id: &str) -> sqlx::Result<Option<Room>> {
        sqlx::query_as::<_, RoomRow>("SELECT room_id,participants,created_at FROM rooms WHERE room_id=?")
            .bind(room_id)
            .fetch_optional(&self.db_pool)
            .await?
            .map(Room::try_from)
            .transpose()
    }

    /// Adds `username` to the room, creating the room first if it is new.
    /// A username already present is not added twice.
    pub async fn join_room(&self, room_id: &str, username: &str) -> sqlx::Result<Room> {
        let mut tx = self.db_pool.begin().await?;

        // writing first takes the write lock for the whole read-modify-write
        sqlx::query("INSERT INTO rooms (room_id,participants,created_at) VALUES (?,'[]',?) ON CONFLICT (room_id) DO NOTHING")
            .bind(room_id)
            .bind(to_millis(now()))
            .execute(&mut *tx)
            .await?;

        let mut room: Room = sqlx::query_as::<_, RoomRow>("SELECT room_id,participants,created_at FROM rooms WHERE room_id=?")
            .bind(room_id)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?;

        if !room.participants.iter().any(|p| p == username) {
            room.participants.push(username.to_owned());
            sqlx::query("UPDATE rooms SET participants=? WHERE room_id=?")
                .bind(Json(&room.participants))
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(room)
    }

    /// Takes `username` out of the room and deletes the room once nobody is left.
    pub async fn leave_room(&self, room_id: &str, username: &str) -> sqlx::Result<Departure> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("UPDATE rooms SET participants=participants WHERE room_id=?")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;

        let Some(row) = sqlx::query_as::<_, RoomRow>("SELECT room_id,participants,created_at FROM rooms WHERE room_id=?")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(Departure::Missing);
        };

        let mut room = Room::try_from(row)?;
        room.participants.retain(|p| p != username);

        let departure = if room.participants.is_empty() {
            sqlx::query("DELETE FROM rooms WHERE room_id=?")
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
            Departure::Deleted
        } else {
            sqlx::query("UPDATE rooms SET participants=? WHERE room_id=?")
                .bind(Json(&room.participants))
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
            Departure::Remaining(room)
        };

        tx.commit().await?;
        Ok(departure)
    }

    pub async fn insert_message(&self, room_id: &str, sender: &str, text: &str) -> sqlx::Result<Message> {
        let message = Message {
            id: Uuid::now_v7(),
            room_id: room_id.to_owned(),
            sender: sender.to_owned(),
            text: text.to_owned(),
            timestamp: now(),
        };

        sqlx::query("INSERT INTO messages (id,room_id,sender,text,timestamp) VALUES (?,?,?,?,?)")
            .bind(message.id.to_string())
            .bind(&message.room_id)
            .bind(&message.sender)
            .bind(&message.text)
            .bind(to_millis(message.timestamp))
            .execute(&self.db_pool)
            .await?;

        Ok(message)
    }

    /// The newest `limit` messages of a room, oldest first.
    pub async fn recent_messages(&self, room_id: &str, limit: i64) -> sqlx::Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM (
                SELECT id,room_id,sender,text,timestamp FROM messages WHERE room_id=?
                ORDER BY timestamp DESC, id DESC LIMIT ?
            ) ORDER BY timestamp ASC, id ASC",
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        collect(rows)
    }

    /// Every message of a room, oldest first.
    pub async fn room_messages(&self, room_id: &str) -> sqlx::Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,room_id,sender,text,timestamp FROM messages WHERE room_id=? ORDER BY timestamp ASC, id ASC",
        )
        .bind(room_id)
        .fetch_all(&self.db_pool)
        .await?;

        collect(rows)
    }

    /// Returns how many messages were removed.
    pub async fn clear_messages(&self, room_id: &str) -> sqlx::Result<u64> {
        Ok(sqlx::query("DELETE FROM messages WHERE room_id=?")
            .bind(room_id)
            .execute(&self.db_pool)
            .await?
            .rows_affected())
    }
}
