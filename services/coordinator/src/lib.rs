//! Session coordinator: durable multi-tenant session storage with
//! websocket fan-out to attached viewers (spec §4.5-§4.7).

pub mod coordinator;
pub mod db;
pub mod http;
pub mod kv;
pub mod state;
pub mod viewer;

use axum::routing::{get, post};
use axum::Router;
use state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/share_create", post(http::share::share_create))
        .route("/share_sync", post(http::share::share_sync))
        .route("/share_delete", post(http::share::share_delete))
        .route("/share_data", get(http::share::share_data))
        .route("/share_poll", get(http::ws::share_poll))
        .route("/healthz", get(http::healthz))
        .route("/readyz", get(http::readyz))
        .with_state(state)
}
