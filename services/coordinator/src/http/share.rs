use crate::http::response::error_response;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use share_protocol::{ShareCreateRequest, ShareCreateResponse, ShareDeleteRequest, PublishEnvelope};

pub async fn share_create(
    State(state): State<AppState>,
    Json(req): Json<ShareCreateRequest>,
) -> Response {
    match state.registry.share(&req.session_id).await {
        Ok(handle) => Json(ShareCreateResponse {
            secret: handle.secret,
            url: state.share_url(&handle.share_name),
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn share_sync(
    State(state): State<AppState>,
    Json(envelope): Json<PublishEnvelope>,
) -> Response {
    let result = state
        .registry
        .publish(
            &envelope.session_id,
            envelope.secret,
            envelope.key,
            envelope.content,
        )
        .await;
    match result {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn share_delete(
    State(state): State<AppState>,
    Json(req): Json<ShareDeleteRequest>,
) -> Response {
    match state.registry.clear(&req.session_id, req.secret).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ShareDataQuery {
    pub id: String,
}

pub async fn share_data(
    State(state): State<AppState>,
    Query(query): Query<ShareDataQuery>,
) -> Response {
    match state.registry.dump(&query.id).await {
        Ok(data) => Json(data).into_response(),
        Err(err) => error_response(err),
    }
}
