use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use share_protocol::ShareError;

pub type HttpResult<T> = Result<T, Response>;

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Render a [`ShareError`] into the frozen `HttpErrorEnvelope` contract
/// (spec §7): same status/code mapping on every route.
pub fn error_response(err: ShareError) -> Response {
    (status_from(err.status_code()), Json(err.to_envelope())).into_response()
}
