use axum::{Json, debug_handler, extract::{Path, State}};

use crate::{AppResult, db::{Message, Store}};

/// The full history of a room, oldest first. Unlike the join-time
/// backlog this is not capped.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn room_messages(
    State(store): State<Store>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(store.room_messages(&room_id).await?))
}
