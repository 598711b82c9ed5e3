use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Json, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use apex_protocol::{agent, BridgeEvent};

use crate::error::AppError;
use crate::state::BridgeState;
use crate::terminal;

/// How long an ask-user rendezvous waits for the host before 408.
const ASK_USER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Loopback guard
// ---------------------------------------------------------------------------

/// Middleware for `/internal/*`: only the in-sandbox MCP adapter may call
/// these, and it always does so over loopback. The preview proxy reaches the
/// bridge over the pod network, so its requests are rejected here.
pub async fn require_loopback(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if addr.ip().is_loopback() {
        next.run(req).await
    } else {
        AppError::not_found("not found").into_response()
    }
}

// ---------------------------------------------------------------------------
// Terminal CRUD
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    command: Option<String>,
}

/// POST /internal/terminal-create — agent-initiated terminal with an auto id.
/// The `terminal_created` event still goes up the host WS so the IDE can
/// render the new tab.
pub async fn terminal_create(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<TerminalCreateBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = format!("mcp-{:08x}", rand::random::<u32>());
    let name = body.name.unwrap_or_else(|| id.clone());
    terminal::create_terminal(
        &state,
        id.clone(),
        name,
        body.cols.unwrap_or(80),
        body.rows.unwrap_or(24),
        body.cwd,
        body.command,
    )
    .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(json!({ "terminalId": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalIdBody {
    terminal_id: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    lines: Option<usize>,
}

/// POST /internal/terminal-write
pub async fn terminal_write(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<TerminalIdBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let t = terminal::get_terminal(&state, &body.terminal_id)
        .ok_or_else(|| AppError::not_found(format!("no terminal with id {}", body.terminal_id)))?;
    let data = body
        .data
        .ok_or_else(|| AppError::bad_request("data is required"))?;
    t.write(&data)
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /internal/terminal-read — the last `lines` scrollback chunks, or all.
pub async fn terminal_read(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<TerminalIdBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let t = terminal::get_terminal(&state, &body.terminal_id)
        .ok_or_else(|| AppError::not_found(format!("no terminal with id {}", body.terminal_id)))?;
    Ok(Json(json!({ "output": t.read_scrollback(body.lines) })))
}

/// POST /internal/terminal-close
pub async fn terminal_close(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<TerminalIdBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let t = terminal::get_terminal(&state, &body.terminal_id)
        .ok_or_else(|| AppError::not_found(format!("no terminal with id {}", body.terminal_id)))?;
    t.kill();
    Ok(Json(json!({ "ok": true })))
}

/// GET /internal/terminal-list
pub async fn terminal_list(
    State(state): State<Arc<BridgeState>>,
) -> Json<serde_json::Value> {
    Json(json!({ "terminals": terminal::list_terminals(&state) }))
}

// ---------------------------------------------------------------------------
// Preview URL proxy
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PreviewUrlBody {
    port: u16,
}

/// POST /internal/preview-url — fetch the platform's signed preview URL for
/// a sandbox port on the agent's behalf, so the token never reaches the
/// agent environment.
pub async fn preview_url(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<PreviewUrlBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let url = format!(
        "{}/sandbox/{}/ports/{}/preview-url",
        state.config.api_url, state.config.sandbox_id, body.port
    );
    let response = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&state.config.api_key)
        .send()
        .await
        .map_err(|e| AppError::internal(format!("preview-url request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::internal(format!(
            "preview-url request returned {}",
            response.status()
        )));
    }
    let payload: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::internal(format!("preview-url response unreadable: {e}")))?;
    Ok(Json(payload))
}

// ---------------------------------------------------------------------------
// Ask-user rendezvous
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskUserBody {
    #[serde(default)]
    chat_id: Option<String>,
    input: serde_json::Value,
}

fn question_id() -> String {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("ask-{ms}-{suffix}")
}

/// POST /internal/ask-user — block until the host answers or 5 minutes pass.
///
/// A synthetic `claude_message` carrying an `AskUserQuestion` tool_use block
/// goes up the WS; the matching `claude_user_answer` resolves the waiter
/// registered here. A `"default"` chatId attaches the question to the most
/// recently started chat.
pub async fn ask_user(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<AskUserBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let chat_id = match body.chat_id.as_deref() {
        None | Some("default") => state
            .last_chat
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        Some(id) => id.to_string(),
    };

    let id = question_id();
    let (tx, rx) = oneshot::channel();
    state.pending_ask.lock().unwrap().insert(id.clone(), tx);

    state.send_event(&BridgeEvent::ClaudeMessage {
        chat_id,
        data: agent::ask_user_record(&id, &body.input),
    });

    match tokio::time::timeout(ASK_USER_TIMEOUT, rx).await {
        Ok(Ok(answer)) => Ok(Json(json!({ "answer": answer }))),
        Ok(Err(_)) => {
            state.pending_ask.lock().unwrap().remove(&id);
            Err(AppError::internal("answer channel closed"))
        }
        Err(_) => {
            state.pending_ask.lock().unwrap().remove(&id);
            Err(AppError::timeout("no answer within 5 minutes"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
