use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use coordinator::coordinator::CoordinatorRegistry;
use coordinator::kv::InMemoryDurable;
use coordinator::state::AppState;
use coordinator::build_router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn setup() -> axum::Router {
    let registry = Arc::new(CoordinatorRegistry::new(Arc::new(InMemoryDurable::new())));
    let state = AppState::new(registry, "https://opencode.ai");
    build_router(state)
}

async fn post_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let val = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, val)
}

async fn get_json(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let val = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, val)
}

#[tokio::test]
async fn healthz_and_readyz_return_ok() {
    let app = setup();
    let (status, _) = get_json(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get_json(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn share_create_is_idempotent_over_http() {
    let app = setup();
    let (status, first) = post_json(
        &app,
        "/share_create",
        json!({ "sessionID": "ses_abcDEF12" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = post_json(
        &app,
        "/share_create",
        json!({ "sessionID": "ses_abcDEF12" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["secret"], second["secret"]);
}

#[tokio::test]
async fn share_sync_then_share_data_round_trips_the_session_info() {
    let app = setup();
    let (_, create) = post_json(
        &app,
        "/share_create",
        json!({ "sessionID": "ses_infoFLOW1" }),
    )
    .await;
    let secret = create["secret"].as_str().unwrap().to_owned();

    let (status, _) = post_json(
        &app,
        "/share_sync",
        json!({
            "sessionID": "ses_infoFLOW1",
            "secret": secret,
            "key": "session/info/ses_infoFLOW1",
            "content": { "title": "hello world" },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, data) = get_json(&app, "/share_data?id=infoFLOW1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data["info"]["title"], "hello world");
}

#[tokio::test]
async fn share_sync_with_wrong_secret_is_forbidden() {
    let app = setup();
    post_json(&app, "/share_create", json!({ "sessionID": "ses_wrongSEC1" })).await;

    let (status, body) = post_json(
        &app,
        "/share_sync",
        json!({
            "sessionID": "ses_wrongSEC1",
            "secret": "not-the-secret",
            "key": "session/info/ses_wrongSEC1",
            "content": {},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn share_delete_clears_entries_but_keeps_the_secret_valid() {
    let app = setup();
    let (_, create) = post_json(&app, "/share_create", json!({ "sessionID": "ses_clearME01" })).await;
    let secret = create["secret"].as_str().unwrap().to_owned();

    post_json(
        &app,
        "/share_sync",
        json!({
            "sessionID": "ses_clearME01",
            "secret": secret,
            "key": "session/info/ses_clearME01",
            "content": { "title": "to be cleared" },
        }),
    )
    .await;

    let (status, _) = post_json(
        &app,
        "/share_delete",
        json!({ "sessionID": "ses_clearME01", "secret": secret.clone() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, data) = get_json(&app, "/share_data?id=clearME01").await;
    assert_eq!(data["info"], Value::Null);

    // The secret still works for a subsequent write.
    let (status, _) = post_json(
        &app,
        "/share_sync",
        json!({
            "sessionID": "ses_clearME01",
            "secret": secret,
            "key": "session/info/ses_clearME01",
            "content": { "title": "after clear" },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn share_data_for_unknown_share_name_is_not_found() {
    let app = setup();
    let (status, body) = get_json(&app, "/share_data?id=doesnotexist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
