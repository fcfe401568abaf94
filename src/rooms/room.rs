use axum::{Json, debug_handler, extract::{Path, State}};

use crate::{AppError, AppResult, db::{Room, Store}};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn room(
    State(store): State<Store>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Room>> {
    let Some(room) = store.find_room(&room_id).await? else {
        return Err(AppError::RoomNotFound);
    };

    Ok(Json(room))
}
