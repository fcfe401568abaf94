pub mod config;
pub mod db;
pub mod events;
pub mod groups;
pub mod rooms;

use axum::{
    Json, Router,
    extract::FromRef,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use config::Config;
pub use db::Store;
pub use groups::Groups;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub groups: Groups,
}

impl AppState {
    pub fn new(store: Store) -> AppState {
        AppState {
            store,
            groups: Groups::default(),
        }
    }
}

/// The whole service: socket, room lookups and a liveness probe.
pub fn app(app_state: AppState, client_url: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(client_url)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(rooms::ws::room_ws))
        .nest("/rooms", rooms::router())
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Room not found")]
    RoomNotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::RoomNotFound => StatusCode::NOT_FOUND,
            AppError::Other(err) => {
                tracing::error!("request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match status {
            StatusCode::NOT_FOUND => self.to_string(),
            _ => "Server error".to_owned(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self::Other(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(axum::Error);
