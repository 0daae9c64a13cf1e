use axum::http::StatusCode;
use perpkeeper::api::{self, AppState};
use tower::util::ServiceExt;

fn get(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = api::create_router(AppState::new());

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_ready_endpoint_waits_for_recovery() {
    let state = AppState::new();
    let app = api::create_router(state.clone());

    let response = app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "starting");

    state.mark_ready();
    let response = app.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ready");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = api::create_router(AppState::new());

    let response = app.oneshot(get("/v1/positions")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
