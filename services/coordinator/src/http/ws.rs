//! `GET /share_poll?id=<shareName>` — websocket handoff from durable backlog
//! to live delivery (spec §4.6, §4.7).

use crate::http::response::error_response;
use crate::state::AppState;
use crate::viewer::ViewerMessage;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, WebSocketUpgradeRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use share_protocol::ViewerFrame;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct SharePollQuery {
    pub id: String,
}

/// Upgrades to a websocket only once the shareName is known to exist and the
/// request actually carries the upgrade headers — `404` and `426` (spec
/// §6.1) are both decided before `ws.on_upgrade` ever runs, rather than
/// accepting the upgrade and closing the socket after the fact.
pub async fn share_poll(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(query): Query<SharePollQuery>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "share_poll request missing upgrade headers");
            return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
        }
    };

    if let Err(err) = state.registry.exists(&query.id).await {
        return error_response(err);
    }

    ws.on_upgrade(move |socket| handle_viewer_socket(socket, state, query.id))
        .into_response()
}

async fn send_frame(socket: &mut WebSocket, frame: &ViewerFrame) -> bool {
    let Ok(json) = serde_json::to_string(frame) else {
        return true;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_viewer_socket(mut socket: WebSocket, state: AppState, share_name: String) {
    let (backlog, viewer_id, mut rx) = match state.registry.attach(&share_name).await {
        Ok(attached) => attached,
        Err(err) => {
            debug!(%share_name, error = %err, "share_poll attach failed");
            let _ = socket.close().await;
            return;
        }
    };

    for frame in &backlog {
        if !send_frame(&mut socket, frame).await {
            return;
        }
    }

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(ViewerMessage::Frame(frame)) => {
                        if !send_frame(&mut socket, &frame).await {
                            return;
                        }
                    }
                    Some(ViewerMessage::Close) | None => {
                        let _ = socket.close().await;
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%share_name, viewer_id, "viewer closed the connection");
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(%share_name, viewer_id, error = %err, "viewer socket error");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
