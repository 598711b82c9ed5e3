use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::BridgeConnection;
use crate::platform::PreviewInfo;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle of one sandbox session, as surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    CloningRepo,
    StartingBridge,
    Connecting,
    Running,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::CloningRepo => "cloning_repo",
            SessionStatus::StartingBridge => "starting_bridge",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Host-side state for one sandbox. The chats and terminals themselves live
/// in the bridge; this is the orchestrator's cached view plus the live
/// connection handle.
pub struct Session {
    pub sandbox_id: String,
    pub internal_id: String,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub project_name: String,
    pub project_dir: String,
    pub preview: Option<PreviewInfo>,
    /// The detached exec session keeping the bridge process alive; paired
    /// create/delete on restart paths.
    pub bridge_exec_session: Option<String>,
    pub connection: Option<BridgeConnection>,
    /// Bumped on every successful connect so a stale event pump can tell it
    /// has been superseded.
    pub conn_epoch: u64,
    /// Whether this host process has connected to the sandbox before; the
    /// first connect always restarts the bridge so it runs current code.
    pub connected_once: bool,
    pub messages: Vec<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_cost_usd: Option<f64>,
    pub result: Option<String>,
    /// Agent session id from the last `result` record; callers use it for
    /// `--resume` after a crash.
    pub agent_session_id: Option<String>,
}

impl Session {
    pub fn new(sandbox_id: String, project_name: String, project_dir: String) -> Self {
        Self {
            sandbox_id,
            internal_id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Creating,
            error: None,
            project_name,
            project_dir,
            preview: None,
            bridge_exec_session: None,
            connection: None,
            conn_epoch: 0,
            connected_once: false,
            messages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            total_cost_usd: None,
            result: None,
            agent_session_id: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_protocol() {
        assert_eq!(SessionStatus::CloningRepo.to_string(), "cloning_repo");
        assert_eq!(SessionStatus::StartingBridge.to_string(), "starting_bridge");
        assert_eq!(SessionStatus::Running.to_string(), "running");
    }

    #[test]
    fn new_session_starts_disconnected_in_creating() {
        let s = Session::new("sb".into(), "My App".into(), "/home/daytona/my-app".into());
        assert_eq!(s.status, SessionStatus::Creating);
        assert!(!s.is_connected());
        assert!(!s.connected_once);
        assert!(s.messages.is_empty());
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn internal_ids_are_unique() {
        let a = Session::new("sb".into(), "p".into(), "/d".into());
        let b = Session::new("sb".into(), "p".into(), "/d".into());
        assert_ne!(a.internal_id, b.internal_id);
    }
}
