use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use apex_protocol::{agent, AgentMode, BridgeEvent, StreamJsonParser};

use crate::state::{AgentHandle, BridgeState};

/// Fixed PTY geometry for agent processes. The agent CLI refuses plain pipes,
/// so it always runs under a PTY wide enough that it never soft-wraps its
/// stream-JSON lines.
const AGENT_COLS: u16 = 200;
const AGENT_ROWS: u16 = 50;

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

fn build_agent_command(
    project_dir: &std::path::Path,
    mode: AgentMode,
    model: Option<&str>,
    session_id: Option<&str>,
) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("claude");
    cmd.arg("--input-format");
    cmd.arg("stream-json");
    cmd.arg("--output-format");
    cmd.arg("stream-json");
    cmd.arg("--verbose");
    cmd.arg("--dangerously-skip-permissions");
    cmd.arg("--disallowed-tools");
    cmd.arg(mode.disallowed_tools());
    if let Some(append) = mode.append_system_prompt() {
        cmd.arg("--append-system-prompt");
        cmd.arg(append);
    }
    if let Some(model) = model {
        cmd.arg("--model");
        cmd.arg(model);
    }
    if let Some(session) = session_id {
        cmd.arg("--resume");
        cmd.arg(session);
    }
    cmd.cwd(project_dir);
    cmd.env("TERM", "xterm-256color");
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        cmd.env("ANTHROPIC_API_KEY", key);
    }
    cmd
}

/// Spawn the agent CLI for a chat that has no process yet.
///
/// The initial prompt is written into the PTY as a stream-JSON user record,
/// the same path follow-up prompts take, so the CLI sees one uniform input
/// stream. Callers must have checked the chat map first; a race on the map
/// here is reported as an error rather than a second spawn.
pub fn spawn_agent(
    state: &Arc<BridgeState>,
    chat_id: String,
    prompt: &str,
    mode: AgentMode,
    model: Option<&str>,
    session_id: Option<&str>,
) -> anyhow::Result<()> {
    let cmd = build_agent_command(&state.config.project_dir, mode, model, session_id);
    spawn_agent_with(state, chat_id, prompt, cmd)
}

/// Spawn an arbitrary command as the chat's agent process. Tests inject
/// commands that echo fixed stream-JSON lines instead of the real CLI.
fn spawn_agent_with(
    state: &Arc<BridgeState>,
    chat_id: String,
    prompt: &str,
    cmd: CommandBuilder,
) -> anyhow::Result<()> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: AGENT_ROWS,
            cols: AGENT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("openpty failed: {e}"))?;

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("failed to spawn agent: {e}"))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("clone reader failed: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow::anyhow!("take writer failed: {e}"))?;

    let handle = Arc::new(AgentHandle {
        writer: Mutex::new(writer),
        killer: Mutex::new(killer),
    });

    {
        let mut agents = state.agents.lock().unwrap();
        if agents.contains_key(&chat_id) {
            handle.killer.lock().unwrap().kill().ok();
            anyhow::bail!("agent already running for chat {chat_id}");
        }
        agents.insert(chat_id.clone(), handle.clone());
    }
    *state.last_chat.lock().unwrap() = Some(chat_id.clone());

    // Reader/waiter: parse stream-JSON lines into claude_message frames,
    // then reap and report the exit. Spawned before the first write so the
    // map entry is reaped even if that write fails.
    {
        let state = state.clone();
        let chat_id = chat_id.clone();
        let master = pair.master;
        tokio::task::spawn_blocking(move || {
            let mut parser = StreamJsonParser::new();
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        for record in parser.push(&chunk) {
                            state.send_event(&BridgeEvent::ClaudeMessage {
                                chat_id: chat_id.clone(),
                                data: record,
                            });
                        }
                    }
                }
            }
            let code = child
                .wait()
                .map(|status| status.exit_code() as i32)
                .unwrap_or(-1);
            drop(master);
            state.agents.lock().unwrap().remove(&chat_id);
            state.send_event(&BridgeEvent::ClaudeExit { chat_id, code });
        });
    }

    if let Err(err) = write_record(&handle, &agent::user_prompt_record(prompt)) {
        handle.killer.lock().unwrap().kill().ok();
        return Err(err);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stdin plumbing
// ---------------------------------------------------------------------------

fn write_record(handle: &AgentHandle, record: &serde_json::Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut writer = handle.writer.lock().unwrap();
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Pipe a follow-up prompt into an already-running chat. Never respawns.
pub fn send_followup(state: &BridgeState, chat_id: &str, prompt: &str) -> anyhow::Result<bool> {
    let handle = state.agents.lock().unwrap().get(chat_id).cloned();
    match handle {
        Some(h) => {
            write_record(&h, &agent::user_prompt_record(prompt))?;
            *state.last_chat.lock().unwrap() = Some(chat_id.to_string());
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Raw passthrough for `claude_input`.
pub fn send_raw_input(state: &BridgeState, chat_id: &str, data: &str) -> anyhow::Result<()> {
    let handle = state
        .agents
        .lock()
        .unwrap()
        .get(chat_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no agent running for chat {chat_id}"))?;
    let mut writer = handle.writer.lock().unwrap();
    writer.write_all(data.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Pipe a tool-result answer into a running chat (`claude_user_answer` for a
/// toolUseId with no pending ask-user rendezvous).
pub fn send_tool_result(
    state: &BridgeState,
    chat_id: &str,
    tool_use_id: &str,
    answer: &str,
) -> anyhow::Result<()> {
    let handle = state
        .agents
        .lock()
        .unwrap()
        .get(chat_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no agent running for chat {chat_id}"))?;
    write_record(&handle, &agent::tool_result_record(tool_use_id, answer))
}

/// Kill one agent process, or every one when `chat_id` is `None`. The
/// reader task still emits the trailing `claude_exit`.
pub fn stop_agents(state: &BridgeState, chat_id: Option<&str>) {
    let handles: Vec<Arc<AgentHandle>> = {
        let agents = state.agents.lock().unwrap();
        match chat_id {
            Some(id) => agents.get(id).cloned().into_iter().collect(),
            None => agents.values().cloned().collect(),
        }
    };
    for handle in handles {
        let _ = handle.killer.lock().unwrap().kill();
    }
}

pub fn agent_count(state: &BridgeState) -> usize {
    state.agents.lock().unwrap().len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BridgeConfig;
    use std::path::PathBuf;

    fn test_state() -> Arc<BridgeState> {
        BridgeState::new(BridgeConfig {
            port: 8080,
            project_dir: PathBuf::from("/tmp"),
            sandbox_id: "sb".into(),
            api_url: String::new(),
            api_key: String::new(),
            skip_ports: vec![],
        })
    }

    #[test]
    fn command_carries_mode_flags() {
        let cmd = build_agent_command(
            std::path::Path::new("/tmp"),
            AgentMode::Plan,
            Some("claude-sonnet-4-6"),
            Some("sess-1"),
        );
        let line = cmd.as_unix_command_line().unwrap();
        assert!(line.contains("--dangerously-skip-permissions"));
        assert!(line.contains("--input-format"));
        assert!(line.contains("stream-json"));
        assert!(line.contains("AskUserQuestion,Edit,Write,MultiEdit"));
        assert!(line.contains("--append-system-prompt"));
        assert!(line.contains("--model"));
        assert!(line.contains("--resume"));
        assert!(line.contains("sess-1"));
    }

    #[test]
    fn agent_mode_omits_resume_and_model_when_absent() {
        let cmd = build_agent_command(std::path::Path::new("/tmp"), AgentMode::Agent, None, None);
        let line = cmd.as_unix_command_line().unwrap();
        assert!(!line.contains("--resume"));
        assert!(!line.contains("--model"));
        assert!(!line.contains("--append-system-prompt"));
    }

    #[test]
    fn followup_for_unknown_chat_reports_absent() {
        let state = test_state();
        let piped = send_followup(&state, "nope", "hello").unwrap();
        assert!(!piped);
    }

    #[test]
    fn raw_input_for_unknown_chat_errors() {
        let state = test_state();
        let err = send_raw_input(&state, "ghost", "x").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn stop_with_no_agents_is_noop() {
        let state = test_state();
        stop_agents(&state, None);
        stop_agents(&state, Some("missing"));
        assert_eq!(agent_count(&state), 0);
    }

    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_typed(rx: &mut mpsc::UnboundedReceiver<String>, want: &str) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            if v["type"] == want {
                return v;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echoed_stream_json_surfaces_as_claude_messages() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.attach_client(tx);

        // A stand-in agent: read one line from stdin and print it back.
        let mut cmd = CommandBuilder::new("sh");
        cmd.arg("-c");
        cmd.arg("read line; printf '%s\\n' \"$line\"");
        cmd.cwd("/tmp");
        spawn_agent_with(&state, "c1".into(), "say hi", cmd).unwrap();
        assert_eq!(agent_count(&state), 1);
        assert_eq!(state.last_chat.lock().unwrap().as_deref(), Some("c1"));

        let msg = next_typed(&mut rx, "claude_message").await;
        assert_eq!(msg["chatId"], "c1");
        assert_eq!(msg["data"]["type"], "user");
        assert_eq!(msg["data"]["message"]["content"], "say hi");

        let exit = next_typed(&mut rx, "claude_exit").await;
        assert_eq!(exit["chatId"], "c1");
        assert_eq!(exit["code"], 0);
        assert_eq!(agent_count(&state), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followup_pipes_into_the_existing_process_without_respawn() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.attach_client(tx);

        let mut cmd = CommandBuilder::new("cat");
        cmd.cwd("/tmp");
        spawn_agent_with(&state, "c1".into(), "first", cmd).unwrap();
        assert_eq!(agent_count(&state), 1);

        // cat relays the first prompt record.
        let first = next_typed(&mut rx, "claude_message").await;
        assert_eq!(first["data"]["message"]["content"], "first");

        // A second prompt for the same chat must reuse the process.
        assert!(send_followup(&state, "c1", "second").unwrap());
        assert_eq!(agent_count(&state), 1, "follow-up must not respawn");

        let second = next_typed(&mut rx, "claude_message").await;
        assert_eq!(second["data"]["message"]["content"], "second");

        // Kill path: the outstanding exit frame is still emitted and the
        // map entry reaped.
        stop_agents(&state, Some("c1"));
        let exit = next_typed(&mut rx, "claude_exit").await;
        assert_eq!(exit["chatId"], "c1");
        assert_eq!(agent_count(&state), 0);
    }
}
