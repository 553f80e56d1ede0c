use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use http::{Method, Request, StatusCode, header};
use relay_core::{RelaySettings, SessionRegistry};
use relay_gateway::{AppState, cors_layer, router};
use serde_json::{Value, json};
use time::Duration as TimeDelta;
use tower::ServiceExt;

#[path = "../../../libs/core/test_support/mod.rs"]
mod support;

use support::{
    CONVERSATION_TOKEN, CountingCredentials, FALLBACK, Harness, PRIMARY, ScriptedDirectLine,
    bot_message, harness, harness_with, lazy_batch, polling_settings, regions,
};

fn app(h: Harness) -> (Router, Arc<ScriptedDirectLine>, Arc<SessionRegistry>) {
    let sessions = Arc::new(SessionRegistry::new());
    let state = AppState::new(h.relay).with_sessions(sessions.clone());
    (router(state), h.api, sessions)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn send_body(text: &str) -> Value {
    json!({
        "conversationId": "conv-1",
        "token": CONVERSATION_TOKEN,
        "baseUri": PRIMARY,
        "text": text
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn short_settings() -> RelaySettings {
    RelaySettings {
        reply_timeout: Duration::from_secs(3),
        poll_interval: Duration::from_secs(1),
        ..polling_settings()
    }
}

#[tokio::test]
async fn healthz_has_no_body() {
    let (app, _, _) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn start_returns_the_session_handle() {
    let (app, api, sessions) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let response = app
        .oneshot(post_json("/api/session/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(
        body,
        json!({"conversationId": "conv-1", "token": CONVERSATION_TOKEN, "baseUri": PRIMARY})
    );
    assert_eq!(api.calls().creates.len(), 1);
    assert_eq!(sessions.len().await, 1);
}

#[tokio::test]
async fn start_reports_failover_endpoint() {
    let h = harness(
        ScriptedDirectLine::new().refuse(PRIMARY, StatusCode::FORBIDDEN),
        polling_settings(),
    );
    let (app, _, _) = app(h);
    let response = app
        .oneshot(post_json("/api/session/start", json!({})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["baseUri"], FALLBACK);
}

#[tokio::test]
async fn rejected_credentials_are_a_bad_gateway() {
    let h = harness_with(
        ScriptedDirectLine::new(),
        CountingCredentials::rejecting(),
        regions(),
        polling_settings(),
    );
    let (app, api, _) = app(h);
    let response = app
        .oneshot(post_json("/api/session/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert!(!body.to_string().contains("bad secret"));
    assert!(api.calls().creates.is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_returns_the_bot_reply() {
    let h = harness(
        ScriptedDirectLine::new().script(vec![lazy_batch(
            |now| vec![bot_message("conv-1|0002", "Hi there", now)],
            "2",
        )]),
        polling_settings(),
    );
    let (app, api, _) = app(h);
    let response = app
        .oneshot(post_json("/api/session/send", send_body("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["text"], "Hi there");
    assert_eq!(body["id"], "conv-1|0002");
    assert_eq!(body["watermark"], "2");
    assert_eq!(body["conversationId"], "conv-1");

    let calls = api.calls();
    assert_eq!(calls.posts.len(), 1);
    assert_eq!(calls.posts[0].token, CONVERSATION_TOKEN);
    assert_eq!(calls.posts[0].endpoint.as_str(), PRIMARY);
}

#[tokio::test(start_paused = true)]
async fn slow_reply_is_accepted_then_collected_by_poll() {
    let (app, api, _) = app(harness(ScriptedDirectLine::new(), short_settings()));

    let response = app
        .clone()
        .oneshot(post_json("/api/session/send", send_body("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let body = json_body(response).await;
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["conversationId"], "conv-1");

    api.push_fetch(lazy_batch(
        |now| vec![bot_message("late", "Sorry for the wait", now + TimeDelta::seconds(1))],
        "7",
    ));
    let response = app
        .oneshot(post_json(
            "/api/session/poll",
            json!({"conversationId": "conv-1", "token": CONVERSATION_TOKEN, "baseUri": PRIMARY}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["text"], "Sorry for the wait");
    assert_eq!(body["watermark"], "7");
    assert_eq!(api.calls().posts.len(), 1);
}

#[tokio::test]
async fn unknown_base_uri_is_rejected_before_any_upstream_call() {
    let (app, api, _) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let mut body = send_body("hello");
    body["baseUri"] = json!("https://attacker.example/v3/directline");
    let response = app
        .oneshot(post_json("/api/session/send", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(api.calls().posts.is_empty());
}

#[tokio::test]
async fn blank_text_without_value_is_a_bad_request() {
    let (app, _, _) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let response = app
        .oneshot(post_json("/api/session/send", send_body("   ")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn upstream_server_errors_map_to_bad_gateway() {
    let api = ScriptedDirectLine::new();
    api.fail_posts(StatusCode::SERVICE_UNAVAILABLE);
    let (app, _, _) = app(harness(api, polling_settings()));
    let response = app
        .oneshot(post_json("/api/session/send", send_body("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        json_body(response).await,
        json!({"error": "Downstream Error: scripted 503 Service Unavailable", "upstreamStatus": 503})
    );
}

#[tokio::test]
async fn expired_conversation_token_is_passed_through() {
    let api = ScriptedDirectLine::new();
    api.fail_posts(StatusCode::UNAUTHORIZED);
    let (app, _, _) = app(harness(api, polling_settings()));
    let response = app
        .oneshot(post_json("/api/session/send", send_body("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["upstreamStatus"], 401);
    assert!(body["error"].as_str().unwrap().contains("401"));
}

#[tokio::test]
async fn failed_sends_do_not_leave_sessions_behind() {
    let api = ScriptedDirectLine::new();
    api.fail_posts(StatusCode::NOT_FOUND);
    let (app, _, sessions) = app(harness(api, polling_settings()));
    for n in 0..5 {
        let mut body = send_body("hello");
        body["conversationId"] = json!(format!("unknown-{n}"));
        let response = app
            .clone()
            .oneshot(post_json("/api/session/send", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    assert!(sessions.is_empty().await);
}

#[tokio::test]
async fn poll_without_turn_or_watermark_is_a_conflict() {
    let (app, api, sessions) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let response = app
        .oneshot(post_json(
            "/api/session/poll",
            json!({"conversationId": "conv-9", "token": CONVERSATION_TOKEN, "baseUri": PRIMARY}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(api.calls().fetches.is_empty());
    assert!(sessions.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_swept() {
    let h = harness(ScriptedDirectLine::new(), polling_settings());
    let sessions = Arc::new(SessionRegistry::new());
    let state = AppState::new(h.relay).with_sessions(sessions.clone());
    let sweeper = state.spawn_idle_sweeper(Duration::from_secs(120));
    let app = router(state);

    let response = app
        .oneshot(post_json("/api/session/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sessions.len().await, 1);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(sessions.is_empty().await);
    sweeper.abort();
}

#[tokio::test]
async fn end_forgets_the_conversation() {
    let (app, _, sessions) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let response = app
        .clone()
        .oneshot(post_json("/api/session/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sessions.len().await, 1);

    let response = app
        .clone()
        .oneshot(post_json("/api/session/end", json!({"conversationId": "conv-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(sessions.is_empty().await);

    let response = app
        .oneshot(post_json("/api/session/end", json!({"conversationId": "conv-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn cors_preflight_allows_the_configured_origin() {
    let (app, _, _) = app(harness(ScriptedDirectLine::new(), polling_settings()));
    let app = app.layer(cors_layer("http://localhost:5173").unwrap());
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/session/send")
                .header(header::ORIGIN, "http://localhost:5173")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:5173"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
        "true"
    );
}
