mod msg;
mod room;
pub mod session;
pub mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{room_id}", get(room::room))
        .route("/{room_id}/messages", get(msg::room_messages))
}
