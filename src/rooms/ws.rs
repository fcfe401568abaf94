use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{AppState, events::ServerEvent};

use super::session::Session;

#[debug_handler]
pub async fn room_ws(State(app_state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve(stream, app_state))
}

async fn serve(stream: WebSocket, app_state: AppState) {
    let (mut sender, mut receiver) = stream.split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut session = Session::new(outbox);
    debug!(session = %session.id(), "socket connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    error!("could not encode {event:?}: {err}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => session.handle_frame(&app_state, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(session = %session.id(), "socket error: {err}");
                    break;
                }
            },
            _ = &mut write_task => break,
        }
    }

    session.disconnect(&app_state).await;
    write_task.abort();
}
