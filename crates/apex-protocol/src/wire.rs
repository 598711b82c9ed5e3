use serde::{Deserialize, Serialize};

// ─── Commands (host → bridge) ─────────────────────────────────────────────

/// Every frame the orchestrator sends down the per-sandbox WebSocket.
///
/// Wire format: `{"type":"start_claude","chatId":"c1",...}` with a
/// snake_case discriminant and camelCase fields.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    StartClaude {
        chat_id: String,
        prompt: String,
        #[serde(default)]
        mode: AgentMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Agent session to resume (`claude --resume`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Raw passthrough to the agent PTY.
    #[serde(rename_all = "camelCase")]
    ClaudeInput { chat_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    ClaudeUserAnswer {
        chat_id: String,
        tool_use_id: String,
        answer: String,
    },
    /// Kill one agent process, or all of them when `chat_id` is absent.
    #[serde(rename_all = "camelCase")]
    StopClaude {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalCreate {
        terminal_id: String,
        name: String,
        cols: u16,
        rows: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// When present, runs `bash -c <command>` instead of the user's shell.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalInput { terminal_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    TerminalResize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    TerminalClose { terminal_id: String },
    TerminalList,
    Ping,
    /// Any frame type this build does not know. Ignored silently.
    #[serde(other)]
    Unknown,
}

// ─── Events (bridge → host) ───────────────────────────────────────────────

/// Every frame the bridge sends up to the orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// First frame on every new WebSocket connection.
    BridgeReady { port: u16 },
    /// One parsed stream-JSON record from the agent, relayed verbatim.
    #[serde(rename_all = "camelCase")]
    ClaudeMessage {
        chat_id: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ClaudeExit { chat_id: String, code: i32 },
    #[serde(rename_all = "camelCase")]
    ClaudeError { chat_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    TerminalCreated { terminal_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    TerminalOutput { terminal_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    TerminalExit { terminal_id: String, code: i32 },
    #[serde(rename_all = "camelCase")]
    TerminalError { terminal_id: String, error: String },
    TerminalList { terminals: Vec<TerminalInfo> },
    /// Directories touched since the last debounce window.
    FileChanged { dirs: Vec<String> },
    PortsUpdate { ports: Vec<PortRow> },
    Pong,
    #[serde(other)]
    Unknown,
}

// ─── Supporting types ─────────────────────────────────────────────────────

/// How the agent CLI is constrained for a chat.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Full tool access; only the interactive ask-user tool is disabled
    /// (questions are routed through the bridge's rendezvous instead).
    #[default]
    Agent,
    /// Read-only exploration: no edits, restricted system prompt.
    Plan,
    /// Answer-only: no edits, no shell.
    Ask,
}

impl AgentMode {
    /// Tools passed to `--disallowed-tools` for this mode.
    pub fn disallowed_tools(self) -> &'static str {
        match self {
            AgentMode::Agent => "AskUserQuestion",
            AgentMode::Plan => "AskUserQuestion,Edit,Write,MultiEdit",
            AgentMode::Ask => "AskUserQuestion,Edit,Write,MultiEdit,Bash",
        }
    }

    /// Extra system prompt appended for restricted modes.
    pub fn append_system_prompt(self) -> Option<&'static str> {
        match self {
            AgentMode::Agent => None,
            AgentMode::Plan => Some(
                "You are in planning mode. Explore the codebase and produce a plan; \
                 do not modify any files.",
            ),
            AgentMode::Ask => Some(
                "You are in question-answering mode. Answer from what you can read; \
                 do not modify any files or run commands.",
            ),
        }
    }
}

/// Snapshot row for `terminal_list`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    /// The retained ring of output chunks, joined into one string.
    pub scrollback: String,
}

/// One externally visible listener, as reported by the port scanner.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortRow {
    pub port: u16,
    pub protocol: String,
    pub process: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_claude_roundtrip_uses_camel_case_fields() {
        let cmd = Command::StartClaude {
            chat_id: "c1".into(),
            prompt: "say hi".into(),
            mode: AgentMode::Plan,
            model: Some("claude-sonnet-4-6".into()),
            session_id: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "start_claude");
        assert_eq!(json["chatId"], "c1");
        assert_eq!(json["mode"], "plan");
        assert!(json.get("sessionId").is_none());

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn stop_claude_without_chat_id_means_all() {
        let cmd: Command = serde_json::from_str(r#"{"type":"stop_claude"}"#).unwrap();
        assert_eq!(cmd, Command::StopClaude { chat_id: None });
    }

    #[test]
    fn unknown_command_type_is_tolerated() {
        let cmd: Command =
            serde_json::from_str(r#"{"type":"warp_core_breach","chatId":"x"}"#).unwrap();
        assert_eq!(cmd, Command::Unknown);
    }

    #[test]
    fn unknown_event_type_is_tolerated() {
        let ev: BridgeEvent = serde_json::from_str(r#"{"type":"telemetry_v9"}"#).unwrap();
        assert_eq!(ev, BridgeEvent::Unknown);
    }

    #[test]
    fn claude_message_preserves_opaque_payload() {
        let frame = r#"{"type":"claude_message","chatId":"c1",
            "data":{"type":"assistant","parent_tool_use_id":null,
                    "message":{"content":[{"type":"text","text":"hi"}]},
                    "some_future_field":42}}"#;
        let ev: BridgeEvent = serde_json::from_str(frame).unwrap();
        let BridgeEvent::ClaudeMessage { chat_id, data } = &ev else {
            panic!("expected claude_message, got {ev:?}");
        };
        assert_eq!(chat_id, "c1");
        // Fields the host does not understand must survive the relay.
        assert_eq!(data["some_future_field"], 42);

        let reserialized = serde_json::to_value(&ev).unwrap();
        assert_eq!(reserialized["data"]["some_future_field"], 42);
    }

    #[test]
    fn mode_flag_derivations() {
        assert_eq!(AgentMode::Agent.disallowed_tools(), "AskUserQuestion");
        assert!(AgentMode::Plan.disallowed_tools().contains("Edit"));
        assert!(AgentMode::Ask.disallowed_tools().contains("Bash"));
        assert!(AgentMode::Agent.append_system_prompt().is_none());
        assert!(AgentMode::Plan.append_system_prompt().is_some());
    }

    #[test]
    fn ports_update_roundtrip() {
        let ev = BridgeEvent::PortsUpdate {
            ports: vec![PortRow {
                port: 3000,
                protocol: "tcp".into(),
                process: "node".into(),
            }],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: BridgeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
