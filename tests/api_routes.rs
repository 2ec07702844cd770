mod common;

use std::sync::Arc;

use agent_run_orchestrator::AppState;
use agent_run_orchestrator::config::{
    AgentServiceConfig, AppConfig, ResilienceConfig, SecurityConfig, ServerConfig, StoreConfig,
};
use agent_run_orchestrator::runs::domain::RunStatus;
use agent_run_orchestrator::runs::security::claims::UserClaims;
use agent_run_orchestrator::runs::security::rate_limit::TokenBucket;
use agent_run_orchestrator::server::build_router;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{Harness, Script, harness, wait_for};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "test-secret";

fn config(jwt_required: bool) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".into(),
        },
        security: SecurityConfig {
            jwt_required,
            jwt_secret: SECRET.into(),
        },
        resilience: ResilienceConfig {
            rate_limit_enabled: false,
            timeout_disabled: false,
            requests_per_second: 100.0,
            burst_size: 100.0,
        },
        agent_service: AgentServiceConfig {
            base_url: "http://127.0.0.1:9".into(),
            connect_timeout_secs: 1,
            request_timeout_secs: None,
        },
        store: StoreConfig {
            provider: "memory".into(),
            database_url: String::new(),
            key_prefix: "agent-run".into(),
            ttl_secs: 3600,
        },
    }
}

fn app_with(h: &Harness, config: AppConfig, limiter: TokenBucket) -> Router {
    build_router(AppState {
        controller: h.controller.clone(),
        rate_limiter: Arc::new(limiter),
        config: Arc::new(config),
    })
}

fn app(h: &Harness) -> Router {
    app_with(h, config(false), TokenBucket::new(100.0, 100.0))
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn start_body() -> Value {
    json!({"workspaceId": "ws-1", "persona": "research", "prompt": "hi"})
}

#[tokio::test]
async fn test_healthz() {
    let h = harness([]);
    let response = app(&h).oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_start_then_poll_status() {
    let h = harness([Script::Lines(vec![r#"{"type":"done"}"#])]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["status"], "queued");
    let run_id = accepted["runId"].as_str().unwrap().to_string();

    wait_for(&h.controller, &run_id, RunStatus::Completed).await;

    let response = app
        .oneshot(get(&format!("/api/runs/{run_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let run = body_json(response).await;
    assert_eq!(run["runId"], run_id.as_str());
    assert_eq!(run["status"], "completed");
    assert_eq!(run["workspaceId"], "ws-1");
    assert!(run.get("error").is_none());
}

#[tokio::test]
async fn test_bearer_token_becomes_credential() {
    let h = harness([Script::Lines(vec![])]);

    let mut request = post_json(
        "/api/runs",
        &json!({"workspaceId": "ws-1", "persona": "research", "prompt": "hi", "credential": "body-token"}),
    );
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer header-token".parse().unwrap());
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();

    wait_for(&h.controller, &run_id, RunStatus::Completed).await;
    assert_eq!(
        h.agent.calls()[0].ctx.credential.as_deref(),
        Some("header-token")
    );
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let h = harness([]);
    let response = app(&h)
        .oneshot(post_json("/api/runs", &json!({"workspaceId": "ws-1"})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    assert!(h.agent.calls().is_empty());
}

#[tokio::test]
async fn test_blank_persona_is_bad_request() {
    let h = harness([]);
    let response = app(&h)
        .oneshot(post_json(
            "/api/runs",
            &json!({"workspaceId": "ws-1", "persona": "", "prompt": "hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "InvalidRequest");
}

#[tokio::test]
async fn test_resume_without_context_conflicts() {
    let h = harness([]);
    let response = app(&h)
        .oneshot(post_json(
            "/api/runs/missing/resume",
            &json!({"decisions": [{"type": "approve"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RunContextMissing");
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_resume_while_running_conflicts() {
    let h = harness([Script::LinesThenHang(vec![r#"{"type":"token","content":"a"}"#])]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();
    wait_for(&h.controller, &run_id, RunStatus::Running).await;

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/runs/{run_id}/resume"),
            &json!({"decisions": [{"type": "approve"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "RunNotResumable");
    assert_eq!(h.agent.calls().len(), 1);

    h.controller.cancel(&run_id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_run_not_found() {
    let h = harness([]);
    let response = app(&h).oneshot(get("/api/runs/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NotFound");

    let response = app(&h).oneshot(get("/api/runs/nope/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_returns_no_content() {
    let h = harness([Script::HangOnConnect]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/runs/{run_id}/cancel"), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (run, _) = wait_for(&h.controller, &run_id, RunStatus::Cancelled).await;
    assert_eq!(run.error, None);
}

#[tokio::test]
async fn test_events_replay_with_cursor() {
    let h = harness([Script::Lines(vec![
        r#"{"type":"token","content":"a"}"#,
        r#"{"type":"token","content":"b"}"#,
    ])]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();
    wait_for(&h.controller, &run_id, RunStatus::Completed).await;

    let page = body_json(
        app.clone()
            .oneshot(get(&format!("/api/runs/{run_id}/events?limit=1")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(page["status"], "completed");
    assert_eq!(page["entries"].as_array().unwrap().len(), 1);
    assert_eq!(page["entries"][0]["data"], r#"{"type":"token","content":"a"}"#);
    let cursor = page["entries"][0]["id"].as_str().unwrap().to_string();

    let rest = body_json(
        app.clone()
            .oneshot(get(&format!("/api/runs/{run_id}/events?after={cursor}")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(rest["entries"].as_array().unwrap().len(), 1);
    assert_eq!(rest["entries"][0]["data"], r#"{"type":"token","content":"b"}"#);

    let response = app
        .oneshot(get(&format!("/api/runs/{run_id}/events?after=not-an-id")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_replays_log_and_ends_with_done() {
    let h = harness([Script::Lines(vec![
        r#"{"type":"token","content":"a"}"#,
        r#"{"type":"done"}"#,
    ])]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();

    // Attach while the run may still be in flight; the tail follows it.
    let response = app
        .oneshot(get(&format!("/api/runs/{run_id}/stream")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let token = text.find(r#"data: {"type":"token","content":"a"}"#).unwrap();
    let done_line = text.find(r#"data: {"type":"done"}"#).unwrap();
    let done_event = text.find("event: done").unwrap();
    assert!(token < done_line && done_line < done_event);
    assert!(text.contains("data: completed"));
}

#[tokio::test]
async fn test_stream_of_cancelled_run_carries_cancelled_line() {
    let h = harness([Script::LinesThenHang(vec![r#"{"type":"token","content":"a"}"#])]);
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"].as_str().unwrap().to_string();
    wait_for(&h.controller, &run_id, RunStatus::Running).await;

    // Attach right after the status flips, before the pipeline has written
    // its own line.
    h.controller.cancel(&run_id).await.unwrap();
    let response = app
        .oneshot(get(&format!("/api/runs/{run_id}/stream")))
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let cancelled_line = text.find(r#""type":"cancelled""#).unwrap();
    let done_event = text.find("event: done").unwrap();
    assert!(cancelled_line < done_event);
    assert!(text.contains("data: cancelled"));
}

#[tokio::test]
async fn test_jwt_required_rejects_anonymous() {
    let h = harness([Script::Lines(vec![])]);
    let app = app_with(&h, config(true), TokenBucket::new(100.0, 100.0));

    let response = app
        .clone()
        .oneshot(post_json("/api/runs", &start_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut request = post_json("/api/runs", &start_body());
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer garbage".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let claims = UserClaims {
        sub: "user-1".into(),
        name: None,
        roles: None,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    let mut request = post_json("/api/runs", &start_body());
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Health stays open.
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit() {
    let h = harness([]);
    let mut config = config(false);
    config.resilience.rate_limit_enabled = true;
    let app = app_with(&h, config, TokenBucket::new(0.001, 1.0));

    let first = app.clone().oneshot(get("/api/runs/x")).await.unwrap();
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let second = app.oneshot(get("/api/runs/x")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn test_rate_limit_off_by_default_config() {
    let h = harness([]);
    let app = app_with(&h, config(false), TokenBucket::new(0.001, 1.0));

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/api/runs/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
