use serde::Serialize;

use apex_protocol::{PortRow, TerminalInfo};

use crate::session::SessionStatus;

// ---------------------------------------------------------------------------
// ManagerEvent
// ---------------------------------------------------------------------------

/// Events fanned out to upstream subscribers (the gateway, tests, CLIs).
///
/// `Message` fires for every bridge frame with the raw frame attached, and
/// `Status` fires on every session transition, so subscribers can build
/// their own projections without the manager anticipating them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    #[serde(rename_all = "camelCase")]
    Message {
        sandbox_id: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        sandbox_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalCreated {
        sandbox_id: String,
        terminal_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalOutput {
        sandbox_id: String,
        terminal_id: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalExit {
        sandbox_id: String,
        terminal_id: String,
        code: i32,
    },
    #[serde(rename_all = "camelCase")]
    TerminalError {
        sandbox_id: String,
        terminal_id: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalList {
        sandbox_id: String,
        terminals: Vec<TerminalInfo>,
    },
    #[serde(rename_all = "camelCase")]
    FileChanged {
        sandbox_id: String,
        dirs: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    PortsUpdate {
        sandbox_id: String,
        ports: Vec<PortRow>,
    },
}

impl ManagerEvent {
    pub fn sandbox_id(&self) -> &str {
        match self {
            ManagerEvent::Message { sandbox_id, .. }
            | ManagerEvent::Status { sandbox_id, .. }
            | ManagerEvent::TerminalCreated { sandbox_id, .. }
            | ManagerEvent::TerminalOutput { sandbox_id, .. }
            | ManagerEvent::TerminalExit { sandbox_id, .. }
            | ManagerEvent::TerminalError { sandbox_id, .. }
            | ManagerEvent::TerminalList { sandbox_id, .. }
            | ManagerEvent::FileChanged { sandbox_id, .. }
            | ManagerEvent::PortsUpdate { sandbox_id, .. } => sandbox_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serialises_with_snake_case_status() {
        let ev = ManagerEvent::Status {
            sandbox_id: "sb".into(),
            status: SessionStatus::StartingBridge,
            error: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["sandboxId"], "sb");
        assert_eq!(json["status"], "starting_bridge");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn every_event_exposes_its_sandbox_id() {
        let ev = ManagerEvent::FileChanged {
            sandbox_id: "sb-9".into(),
            dirs: vec!["src".into()],
        };
        assert_eq!(ev.sandbox_id(), "sb-9");
    }
}
