use axum::{
    Json, Router, debug_handler,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{
    bots::Bot,
    dispatcher::{IntegrityReport, StatusSnapshot},
    errors::DispatchError,
    events::DispatchEvent,
    orders::{Order, Priority},
    state::AppState,
};

/// Body of `POST /orders`. The tag is validated here, before the dispatcher
/// sees it.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrder {
    pub priority: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedBot {
    pub removed: Option<Bot>,
}

/// Frames pushed over `/ws`: one snapshot on connect, then every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WsFrame {
    Snapshot(StatusSnapshot),
    Event(DispatchEvent),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Dispatch(DispatchError::UnsupportedPriority(_)) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(DispatchError::CapacityReached { .. }) => StatusCode::CONFLICT,
            ApiError::Dispatch(DispatchError::UnknownBot(_) | DispatchError::UnknownOrder(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Dispatch(DispatchError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[debug_handler]
pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<NewOrder>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let priority: Priority = payload.priority.parse()?;
    let order = state.dispatcher.submit_order(priority);
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn add_bot(State(state): State<AppState>) -> Result<(StatusCode, Json<Bot>), ApiError> {
    let bot = state.dispatcher.add_bot()?;
    Ok((StatusCode::CREATED, Json(bot)))
}

pub async fn remove_latest_bot(State(state): State<AppState>) -> Json<RemovedBot> {
    Json(RemovedBot {
        removed: state.dispatcher.remove_bot(),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.dispatcher.snapshot())
}

pub async fn integrity(State(state): State<AppState>) -> Json<IntegrityReport> {
    Json(state.dispatcher.check_integrity())
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

fn frame_text(frame: &WsFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            warn!(%err, "could not encode ws frame");
            None
        }
    }
}

async fn stream_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // subscribe first so nothing between the snapshot and the first event is lost
    let mut events = state.dispatcher.subscribe();

    let snapshot = WsFrame::Snapshot(state.dispatcher.snapshot());
    let Some(msg) = frame_text(&snapshot) else {
        return;
    };
    if sender.send(msg).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let frame = match event {
                    Ok(event) => WsFrame::Event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws subscriber lagged, resending snapshot");
                        WsFrame::Snapshot(state.dispatcher.snapshot())
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(msg) = frame_text(&frame) else { continue };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    debug!("ws client disconnected");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/bots", post(add_bot))
        .route("/bots/latest", delete(remove_latest_bot))
        .route("/status", get(status))
        .route("/integrity", get(integrity))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
