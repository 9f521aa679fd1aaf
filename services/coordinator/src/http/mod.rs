pub mod response;
pub mod share;
pub mod ws;

use axum::response::IntoResponse;

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

pub async fn readyz() -> impl IntoResponse {
    "ok"
}
