//! Router-level tests for the bridge's HTTP surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use apex_bridge::state::{BridgeConfig, BridgeState};
use apex_bridge::{build_router, ws};

fn test_state() -> Arc<BridgeState> {
    BridgeState::new(BridgeConfig {
        port: 8080,
        project_dir: PathBuf::from("/tmp"),
        sandbox_id: "sb-1".into(),
        api_url: "http://localhost:1".into(),
        api_key: "key".into(),
        skip_ports: vec![9090, 22],
    })
}

fn request(method: &str, uri: &str, body: Option<serde_json::Value>, peer: [u8; 4]) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let mut req = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 54321))));
    req
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_probe_answers_bridge_ok() {
    let app = build_router(test_state());
    let response = app
        .oneshot(request("GET", "/", None, [127, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"bridge-ok");
}

#[tokio::test]
async fn internal_routes_reject_non_loopback_peers() {
    let app = build_router(test_state());
    let response = app
        .oneshot(request(
            "GET",
            "/internal/terminal-list",
            None,
            [10, 0, 0, 7],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_terminal_list_starts_empty() {
    let app = build_router(test_state());
    let response = app
        .oneshot(request(
            "GET",
            "/internal/terminal-list",
            None,
            [127, 0, 0, 1],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["terminals"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn terminal_write_for_unknown_id_is_404_with_error_body() {
    let app = build_router(test_state());
    let response = app
        .oneshot(request(
            "POST",
            "/internal/terminal-write",
            Some(serde_json::json!({ "terminalId": "ghost", "data": "ls\n" })),
            [127, 0, 0, 1],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test(flavor = "multi_thread")]
async fn mcp_terminal_create_assigns_prefixed_id_and_notifies_host() {
    let state = test_state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.attach_client(tx);

    let app = build_router(state.clone());
    let response = app
        .oneshot(request(
            "POST",
            "/internal/terminal-create",
            Some(serde_json::json!({ "name": "dev", "command": "echo mcp-hello" })),
            [127, 0, 0, 1],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let id = body["terminalId"].as_str().unwrap().to_string();
    assert!(id.starts_with("mcp-"), "id was {id}");
    assert_eq!(id.len(), "mcp-".len() + 8);

    // The IDE-facing event still goes up the WS.
    let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["type"], "terminal_created");
    assert_eq!(event["terminalId"], id.as_str());
    assert_eq!(event["name"], "dev");
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_user_round_trip_delivers_answer() {
    let state = test_state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.attach_client(tx);
    *state.last_chat.lock().unwrap() = Some("c1".into());

    let app = build_router(state.clone());
    let ask = tokio::spawn(async move {
        app.oneshot(request(
            "POST",
            "/internal/ask-user",
            Some(serde_json::json!({ "chatId": "default", "input": { "question": "pick one" } })),
            [127, 0, 0, 1],
        ))
        .await
        .unwrap()
    });

    // The synthetic tool_use block surfaces as a claude_message on the
    // most recently started chat.
    let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["type"], "claude_message");
    assert_eq!(event["chatId"], "c1");
    let block = &event["data"]["message"]["content"][0];
    assert_eq!(block["type"], "tool_use");
    assert_eq!(block["name"], "AskUserQuestion");
    assert_eq!(block["input"]["question"], "pick one");
    let question_id = block["id"].as_str().unwrap();
    assert!(question_id.starts_with("ask-"));

    // Host answers through the regular command path.
    let answer = serde_json::json!({
        "type": "claude_user_answer",
        "chatId": "c1",
        "toolUseId": question_id,
        "answer": "42",
    });
    ws::dispatch(&state, &answer.to_string());

    let response = ask.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["answer"], "42");
    assert!(state.pending_ask.lock().unwrap().is_empty());
}
