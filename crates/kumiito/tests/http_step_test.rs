use kumiito::http::{HTTP_METADATA_KEY, RAW_RESPONSE_KEY};
use kumiito::prelude::*;
use kumiito::resilience::CircuitState;
use kumiito::transform::FieldSelector;
use kumiito::validate::RequiredFields;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(config: ResilienceConfig) -> Arc<ResilientClient> {
    Arc::new(ResilientClient::new("screens", config).expect("client builds"))
}

fn fast() -> kumiito::resilience::ResilienceConfigBuilder {
    ResilienceConfig::builder()
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
        .jitter(false)
}

fn screen_context() -> ExecutionContext {
    let ctx = ExecutionContext::new("screens");
    ctx.set("screen_id", "welcome");
    ctx.set("user_id", "u1");
    ctx
}

#[tokio::test]
async fn test_get_screen_interpolates_path_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screens/welcome"))
        .and(query_param("user_id", "u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "welcome",
            "title": "Welcome",
            "_debug": {"rendered_in": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let step = HttpStep::builder("fetch_screen", client(ResilienceConfig::default()))
        .get(format!(
            "{}/api/screens/${{screen_id}}?user_id=${{user_id}}",
            server.uri()
        ))
        .result_key("screen")
        .build()
        .expect("valid step");

    let ctx = screen_context();
    step.run(&ctx).await.expect("call succeeds");

    assert_eq!(
        ctx.get("screen"),
        Some(json!({"id": "welcome", "title": "Welcome", "_debug": {"rendered_in": 3}}))
    );
    let metadata = ctx.get_map(HTTP_METADATA_KEY).expect("metadata stored");
    assert_eq!(metadata.get("status_code"), Some(&json!(200)));
    assert_eq!(metadata.get("method"), Some(&json!("GET")));
    assert_eq!(metadata.get("fallback"), Some(&json!(false)));
}

#[tokio::test]
async fn test_unresolved_placeholder_is_sent_literally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screens/welcome"))
        .and(query_param("user_id", "${user_id}"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "welcome"})))
        .expect(1)
        .mount(&server)
        .await;

    let step = HttpStep::builder("fetch_screen", client(ResilienceConfig::default()))
        .get(format!(
            "{}/api/screens/${{screen_id}}?user_id=${{user_id}}",
            server.uri()
        ))
        .build()
        .expect("valid step");

    let ctx = ExecutionContext::new("screens");
    ctx.set("screen_id", "welcome");
    step.run(&ctx).await.expect("call succeeds");
    assert!(ctx.has("http_response"));
}

#[tokio::test]
async fn test_fallback_after_exhausted_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/screens/welcome"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let config = fast()
        .max_retries(2)
        .fallback(200, r#"{"blocks":[],"offline":true}"#)
        .build()
        .expect("valid config");
    let step = HttpStep::builder("fetch_screen", client(config))
        .get(format!("{}/api/screens/${{screen_id}}", server.uri()))
        .result_key("screen")
        .build()
        .expect("valid step");

    let ctx = screen_context();
    step.run(&ctx).await.expect("fallback served");

    assert_eq!(ctx.get("screen"), Some(json!({"blocks": [], "offline": true})));
    let metadata = ctx.get_map(HTTP_METADATA_KEY).expect("metadata stored");
    assert_eq!(metadata.get("fallback"), Some(&json!(true)));
    assert_eq!(metadata.get("status_code"), Some(&json!(200)));
}

#[tokio::test]
async fn test_exhausted_retries_without_fallback_is_unexpected_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let config = fast().max_retries(1).build().expect("valid config");
    let step = HttpStep::builder("fetch_screen", client(config))
        .get(format!("{}/api/screens/welcome", server.uri()))
        .build()
        .expect("valid step");

    let err = step.run(&screen_context()).await.expect_err("503 is not expected");
    assert!(matches!(err, FlowError::UnexpectedStatus { status: 503, .. }));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let step = HttpStep::builder("fetch_screen", client(fast().build().expect("valid config")))
        .get(format!("{}/api/screens/missing", server.uri()))
        .build()
        .expect("valid step");

    let err = step.run(&screen_context()).await.expect_err("404");
    assert!(matches!(err, FlowError::UnexpectedStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_post_json_body_with_auth_transformer_and_validator() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/progress"))
        .and(header("authorization", "Bearer t0k"))
        .and(body_json(json!({"user": "u1", "screen": "welcome", "step": 2})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "saved": true,
            "revision": 7,
            "_meta": {"shard": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut body = Map::new();
    body.insert("user".into(), json!("${user_id}"));
    body.insert("screen".into(), json!("${screen_id}"));
    body.insert("step".into(), json!("${progress.step}"));

    let step = HttpStep::builder("save_progress", client(ResilienceConfig::default()))
        .post(format!("{}/api/progress", server.uri()))
        .bearer_token("${token}")
        .json_body(body)
        .transformer(Arc::new(FieldSelector::new(["saved", "revision"])))
        .validator(Arc::new(RequiredFields::new(["saved"])))
        .result_key("progress_result")
        .build()
        .expect("valid step");

    let ctx = screen_context();
    ctx.set("token", "t0k");
    ctx.set("progress", json!({"step": 2}));
    step.run(&ctx).await.expect("saved");

    assert_eq!(
        ctx.get("progress_result"),
        Some(json!({"saved": true, "revision": 7}))
    );
}

#[tokio::test]
async fn test_validation_failure_aborts_step() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "x"})))
        .mount(&server)
        .await;

    let step = HttpStep::builder("fetch_screen", client(ResilienceConfig::default()))
        .get(format!("{}/api/screens/welcome", server.uri()))
        .validator(Arc::new(RequiredFields::new(["id"])))
        .build()
        .expect("valid step");

    let ctx = screen_context();
    let err = step.run(&ctx).await.expect_err("id missing");
    assert!(matches!(
        err,
        FlowError::Validation(ValidationError::MissingField { .. })
    ));
    assert!(!ctx.has("http_response"));
}

#[tokio::test]
async fn test_non_json_body_is_wrapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;

    let step = HttpStep::builder("ping", client(ResilienceConfig::default()))
        .get(format!("{}/ping", server.uri()))
        .build()
        .expect("valid step");

    let ctx = ExecutionContext::new("ping");
    step.run(&ctx).await.expect("pong");
    assert_eq!(ctx.get("http_response"), Some(json!({ RAW_RESPONSE_KEY: "pong" })));
}

#[tokio::test]
async fn test_empty_body_is_wrapped() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/sessions/u1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let step = HttpStep::builder("logout", client(ResilienceConfig::default()))
        .delete(format!("{}/api/sessions/${{user_id}}", server.uri()))
        .result_key("logout")
        .build()
        .expect("valid step");

    let ctx = screen_context();
    step.run(&ctx).await.expect("204 is expected");
    assert_eq!(ctx.get("logout"), Some(json!({ RAW_RESPONSE_KEY: "" })));
    assert_eq!(ctx.get_path("http_metadata.content_length"), Some(json!(0)));
}

#[tokio::test]
async fn test_breaker_opens_on_repeated_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let config = fast()
        .max_retries(0)
        .failure_threshold(2)
        .open_delay(Duration::from_secs(60))
        .build()
        .expect("valid config");
    let client = client(config);
    let step = HttpStep::builder("fetch_screen", Arc::clone(&client))
        .get(format!("{}/api/screens/welcome", server.uri()))
        .build()
        .expect("valid step");

    let ctx = screen_context();
    for _ in 0..2 {
        assert!(matches!(
            step.run(&ctx).await,
            Err(FlowError::UnexpectedStatus { status: 500, .. })
        ));
    }
    assert_eq!(client.circuit_state(), CircuitState::Open);
    assert!(matches!(
        step.run(&ctx).await,
        Err(FlowError::Transport { .. })
    ));
}

#[tokio::test]
async fn test_cancellation_interrupts_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let step = HttpStep::builder("slow", client(ResilienceConfig::default()))
        .get(format!("{}/slow", server.uri()))
        .build()
        .expect("valid step");

    let (ctx, _handle) = ExecutionContext::new("slow").with_timeout(Duration::from_millis(50));
    let err = step.run(&ctx).await.expect_err("deadline passes first");
    assert!(matches!(err, FlowError::Timeout { .. }));
}

#[tokio::test]
async fn test_flow_of_http_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users/u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1", "tier": "gold"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/screens/welcome"))
        .and(query_param("tier", "gold"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "welcome"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(ResilienceConfig::default());
    let user = HttpStep::builder("fetch_user", Arc::clone(&client))
        .get(format!("{}/api/users/${{user_id}}", server.uri()))
        .result_key("user")
        .build()
        .expect("valid step");
    let screen = HttpStep::builder("fetch_screen", Arc::clone(&client))
        .get(format!("{}/api/screens/${{screen_id}}", server.uri()))
        .query("tier", "${user.tier}")
        .result_key("screen")
        .build()
        .expect("valid step");

    let flow = Flow::builder("welcome")
        .step(user)
        .step(screen)
        .build()
        .expect("valid flow");

    let ctx = screen_context();
    let result = flow.execute(&ctx).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(ctx.get_path("screen.id"), Some(json!("welcome")));
}
