use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use apex_protocol::{BridgeEvent, Command};

use crate::state::BridgeState;
use crate::{agent, terminal};

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

/// GET / — the bridge's front door.
///
/// A plain GET answers `bridge-ok` (the health probe the orchestrator polls
/// during bring-up); a WebSocket upgrade on the same URL becomes the
/// orchestrator connection. One preview URL covers both.
pub async fn root(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<BridgeState>>,
) -> Response {
    match ws {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response(),
        Err(_) => "bridge-ok".into_response(),
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<BridgeState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let generation = state.attach_client(tx);
    tracing::info!(generation, "orchestrator connected");

    state.send_event(&BridgeEvent::BridgeReady {
        port: state.config.port,
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch(&state, text.as_str()),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // no binary frames in this protocol
        }
    }

    // If we were replaced by a newer connection the agents now belong to it;
    // only an unreplaced drop means the host is gone.
    if state.detach_client(generation) {
        tracing::info!(generation, "orchestrator disconnected; stopping agents");
        agent::stop_agents(&state, None);
    } else {
        tracing::debug!(generation, "connection superseded");
    }
    writer.abort();
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Handle one inbound frame. Per-command failures become typed error frames;
/// nothing here can take the bridge down.
pub fn dispatch(state: &Arc<BridgeState>, frame: &str) {
    let command: Command = match serde_json::from_str(frame) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!("unparseable frame dropped: {err}");
            return;
        }
    };

    match command {
        Command::StartClaude {
            chat_id,
            prompt,
            mode,
            model,
            session_id,
        } => {
            // A chat that already has a process gets the prompt piped in as
            // a follow-up; respawning would sever the agent's context.
            match agent::send_followup(state, &chat_id, &prompt) {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    state.send_event(&BridgeEvent::ClaudeError {
                        chat_id,
                        error: err.to_string(),
                    });
                    return;
                }
            }
            if let Err(err) = agent::spawn_agent(
                state,
                chat_id.clone(),
                &prompt,
                mode,
                model.as_deref(),
                session_id.as_deref(),
            ) {
                state.send_event(&BridgeEvent::ClaudeError {
                    chat_id,
                    error: err.to_string(),
                });
            }
        }
        Command::ClaudeInput { chat_id, data } => {
            if let Err(err) = agent::send_raw_input(state, &chat_id, &data) {
                state.send_event(&BridgeEvent::ClaudeError {
                    chat_id,
                    error: err.to_string(),
                });
            }
        }
        Command::ClaudeUserAnswer {
            chat_id,
            tool_use_id,
            answer,
        } => {
            // Route (a): resolve a pending ask-user rendezvous.
            let waiter = state.pending_ask.lock().unwrap().remove(&tool_use_id);
            if let Some(tx) = waiter {
                let _ = tx.send(answer);
                return;
            }
            // Route (b): an ordinary tool-result reply for the agent.
            if let Err(err) = agent::send_tool_result(state, &chat_id, &tool_use_id, &answer) {
                state.send_event(&BridgeEvent::ClaudeError {
                    chat_id,
                    error: err.to_string(),
                });
            }
        }
        Command::StopClaude { chat_id } => {
            agent::stop_agents(state, chat_id.as_deref());
        }
        Command::TerminalCreate {
            terminal_id,
            name,
            cols,
            rows,
            cwd,
            command,
        } => {
            if let Err(err) =
                terminal::create_terminal(state, terminal_id.clone(), name, cols, rows, cwd, command)
            {
                state.send_event(&BridgeEvent::TerminalError {
                    terminal_id,
                    error: err.to_string(),
                });
            }
        }
        Command::TerminalInput { terminal_id, data } => {
            match terminal::get_terminal(state, &terminal_id) {
                Some(t) => {
                    if let Err(err) = t.write(&data) {
                        state.send_event(&BridgeEvent::TerminalError {
                            terminal_id,
                            error: err.to_string(),
                        });
                    }
                }
                None => send_terminal_missing(state, terminal_id),
            }
        }
        Command::TerminalResize {
            terminal_id,
            cols,
            rows,
        } => match terminal::get_terminal(state, &terminal_id) {
            Some(t) => {
                if let Err(err) = t.resize(cols, rows) {
                    state.send_event(&BridgeEvent::TerminalError {
                        terminal_id,
                        error: err.to_string(),
                    });
                }
            }
            None => send_terminal_missing(state, terminal_id),
        },
        Command::TerminalClose { terminal_id } => {
            match terminal::get_terminal(state, &terminal_id) {
                Some(t) => t.kill(),
                None => send_terminal_missing(state, terminal_id),
            }
        }
        Command::TerminalList => {
            state.send_event(&BridgeEvent::TerminalList {
                terminals: terminal::list_terminals(state),
            });
        }
        Command::Ping => state.send_event(&BridgeEvent::Pong),
        Command::Unknown => {} // forward-compat: ignore silently
    }
}

fn send_terminal_missing(state: &BridgeState, terminal_id: String) {
    let error = format!("no terminal with id {terminal_id}");
    state.send_event(&BridgeEvent::TerminalError { terminal_id, error });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BridgeConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    fn attached_state() -> (Arc<BridgeState>, mpsc::UnboundedReceiver<String>) {
        let state = BridgeState::new(BridgeConfig {
            port: 8080,
            project_dir: PathBuf::from("/tmp"),
            sandbox_id: "sb".into(),
            api_url: String::new(),
            api_key: String::new(),
            skip_ports: vec![],
        });
        let (tx, rx) = mpsc::unbounded_channel();
        state.attach_client(tx);
        (state, rx)
    }

    async fn next_typed(rx: &mut mpsc::UnboundedReceiver<String>, want: &str) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            if v["type"] == want {
                return v;
            }
        }
    }

    #[tokio::test]
    async fn ping_yields_pong() {
        let (state, mut rx) = attached_state();
        dispatch(&state, r#"{"type":"ping"}"#);
        let v = next_typed(&mut rx, "pong").await;
        assert_eq!(v["type"], "pong");
    }

    #[tokio::test]
    async fn unknown_frame_is_ignored() {
        let (state, mut rx) = attached_state();
        dispatch(&state, r#"{"type":"from_the_future","x":1}"#);
        dispatch(&state, "not even json");
        dispatch(&state, r#"{"type":"ping"}"#);
        // Only the pong arrives; the garbage produced nothing.
        let v = next_typed(&mut rx, "pong").await;
        assert_eq!(v["type"], "pong");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_input_for_missing_id_yields_terminal_error() {
        let (state, mut rx) = attached_state();
        dispatch(
            &state,
            r#"{"type":"terminal_input","terminalId":"ghost","data":"ls\n"}"#,
        );
        let v = next_typed(&mut rx, "terminal_error").await;
        assert_eq!(v["terminalId"], "ghost");
        assert!(v["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn terminal_list_on_empty_state() {
        let (state, mut rx) = attached_state();
        dispatch(&state, r#"{"type":"terminal_list"}"#);
        let v = next_typed(&mut rx, "terminal_list").await;
        assert_eq!(v["terminals"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn user_answer_resolves_pending_rendezvous_first() {
        let (state, _rx) = attached_state();
        let (tx, rx_ans) = tokio::sync::oneshot::channel();
        state
            .pending_ask
            .lock()
            .unwrap()
            .insert("ask-1-abc".into(), tx);

        dispatch(
            &state,
            r#"{"type":"claude_user_answer","chatId":"c1","toolUseId":"ask-1-abc","answer":"42"}"#,
        );
        assert_eq!(rx_ans.await.unwrap(), "42");
        assert!(state.pending_ask.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_answer_without_rendezvous_needs_running_chat() {
        let (state, mut rx) = attached_state();
        dispatch(
            &state,
            r#"{"type":"claude_user_answer","chatId":"c1","toolUseId":"toolu_9","answer":"ok"}"#,
        );
        let v = next_typed(&mut rx, "claude_error").await;
        assert_eq!(v["chatId"], "c1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_terminal_create_reports_error() {
        let (state, mut rx) = attached_state();
        dispatch(
            &state,
            r#"{"type":"terminal_create","terminalId":"t1","name":"a","cols":80,"rows":24,"command":"sleep 5"}"#,
        );
        next_typed(&mut rx, "terminal_created").await;
        dispatch(
            &state,
            r#"{"type":"terminal_create","terminalId":"t1","name":"b","cols":80,"rows":24,"command":"echo x"}"#,
        );
        let v = next_typed(&mut rx, "terminal_error").await;
        assert_eq!(v["terminalId"], "t1");

        if let Some(t) = terminal::get_terminal(&state, "t1") {
            t.kill();
        }
    }
}
