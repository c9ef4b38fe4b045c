// Admin API integration tests: the full router over a loopback-backed service.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use hydra_mcp::mcp::types::ToolDescriptor;
use hydra_mcp::mcp::{ClientSettings, LoopbackFactory, LoopbackServer, McpService, MemoryStore};
use hydra_mcp::state::AppState;

fn test_state() -> AppState {
    let factory = LoopbackFactory::new();
    factory.register(
        "echo",
        LoopbackServer::new().with_name("echo").with_tool(ToolDescriptor {
            name: "echo".into(),
            description: Some("Echo arguments".into()),
            input_schema: json!({ "type": "object", "properties": {} }),
        }),
    );
    let service = McpService::new(
        Arc::new(MemoryStore::default()),
        Arc::new(factory),
        ClientSettings::default(),
    );
    AppState::new(service)
}

fn app(state: &AppState) -> axum::Router {
    hydra_mcp::create_router(state.clone())
}

/// Collect a response body into a `serde_json::Value`.
async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

async fn create_echo(state: &AppState) -> Value {
    let response = app(state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers",
            json!({ "id": "echo", "name": "Echo", "url": "loopback://echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

// ── Health ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_starting_until_ready() {
    let state = test_state();

    let response = app(&state).oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "starting");
    assert_eq!(json["app"], "hydra-mcp");
    assert!(json["version"].is_string());

    let response = app(&state).oneshot(get("/api/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.mark_ready();
    let response = app(&state).oneshot(get("/api/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let state = test_state();
    let response = app(&state).oneshot(get("/api/nonexistent")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ── Servers ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_list_servers() {
    let state = test_state();
    let created = create_echo(&state).await;
    assert_eq!(created["config"]["id"], "echo");
    assert_eq!(created["state"]["status"], "connected");

    let response = app(&state).oneshot(get("/api/mcp/servers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["state"]["tools"][0]["name"], "echo");
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let state = test_state();

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers",
            json!({ "name": "Bad", "url": "ftp://example.com" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers",
            json!({ "name": "  ", "url": "loopback://echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_rejects_colon_in_id() {
    let state = test_state();

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers",
            json!({ "id": "echo:two", "name": "Echo", "url": "loopback://echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["mcp_code"], "INVALID_SERVER_ID");

    let response = app(&state).oneshot(get("/api/mcp/servers")).await.unwrap();
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn duplicate_create_is_conflict() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers",
            json!({ "id": "echo", "name": "Echo", "url": "loopback://echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"]["mcp_code"], "DUPLICATE_SERVER");
}

#[tokio::test]
async fn patch_updates_fields() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state)
        .oneshot(send_json(
            "PATCH",
            "/api/mcp/servers/echo",
            json!({ "description": "renamed", "name": "Echo 2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["config"]["name"], "Echo 2");
    assert_eq!(json["config"]["description"], "renamed");
    assert_eq!(json["state"]["status"], "connected");
}

#[tokio::test]
async fn missing_server_is_404() {
    let state = test_state();
    for request in [
        send_json("PATCH", "/api/mcp/servers/ghost", json!({ "name": "x" })),
        post("/api/mcp/servers/ghost/toggle"),
        post("/api/mcp/servers/ghost/connect"),
        post("/api/mcp/servers/ghost/disconnect"),
        Request::builder()
            .method("DELETE")
            .uri("/api/mcp/servers/ghost")
            .body(Body::empty())
            .unwrap(),
    ] {
        let response = app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["mcp_code"], "SERVER_NOT_FOUND");
    }
}

#[tokio::test]
async fn toggle_disconnect_connect_and_delete() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state).oneshot(post("/api/mcp/servers/echo/toggle")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["config"]["enabled"], false);
    assert_eq!(json["state"]["status"], "disconnected");

    // Disabled servers refuse to connect.
    let response = app(&state).oneshot(post("/api/mcp/servers/echo/connect")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["connected"], false);

    app(&state).oneshot(post("/api/mcp/servers/echo/toggle")).await.unwrap();
    let response = app(&state).oneshot(post("/api/mcp/servers/echo/disconnect")).await.unwrap();
    assert_eq!(body_json(response).await["state"]["status"], "disconnected");

    let response = app(&state).oneshot(post("/api/mcp/servers/echo/connect")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["connected"], true);
    assert_eq!(json["server"]["state"]["status"], "connected");

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/mcp/servers/echo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.service.get_servers().is_empty());
}

#[tokio::test]
async fn connection_test_does_not_register() {
    let state = test_state();

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers/test",
            json!({ "name": "Echo", "url": "loopback://echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["tools"][0]["name"], "echo");

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/servers/test",
            json!({ "name": "Nope", "url": "loopback://nope" }),
        ))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(json["error"].is_string());

    assert!(state.service.get_servers().is_empty());
}

// ── Tools ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_tools_includes_declarations() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state).oneshot(get("/api/mcp/tools")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tools"][0]["key"], "echo:echo");
    assert_eq!(json["tools"][0]["server_name"], "Echo");
    assert_eq!(json["declarations"][0]["name"], "mcp_echo_echo");
    assert_eq!(json["declarations"][0]["parameters"]["type"], "object");
}

#[tokio::test]
async fn call_tool_by_key_and_by_function_name() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/tools/call",
            json!({ "key": "echo:echo", "arguments": { "text": "hi" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["text"], r#"{"text":"hi"}"#);
    assert_eq!(json["result"]["isError"], false);

    let response = app(&state)
        .oneshot(send_json(
            "POST",
            "/api/mcp/tools/call",
            json!({ "name": "mcp_echo_echo" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["text"], "{}");
}

#[tokio::test]
async fn call_tool_errors() {
    let state = test_state();
    create_echo(&state).await;

    let cases = [
        (json!({ "arguments": {} }), StatusCode::BAD_REQUEST),
        (json!({ "key": "no-colon" }), StatusCode::BAD_REQUEST),
        (json!({ "key": "echo:echo", "arguments": [1, 2] }), StatusCode::BAD_REQUEST),
        (json!({ "key": "echo:missing" }), StatusCode::NOT_FOUND),
        (json!({ "name": "mcp_missing" }), StatusCode::NOT_FOUND),
    ];
    for (body, expected) in cases {
        let response = app(&state)
            .oneshot(send_json("POST", "/api/mcp/tools/call", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "body: {body}");
    }
}

// ── Stats ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn stats_reflect_registry() {
    let state = test_state();
    create_echo(&state).await;

    let response = app(&state).oneshot(get("/api/mcp/stats")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["total_servers"], 1);
    assert_eq!(json["connected"], 1);
    assert_eq!(json["total_tools"], 1);
}

#[tokio::test]
async fn events_stream_is_sse() {
    let state = test_state();
    let response = app(&state).oneshot(get("/api/mcp/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));
}
