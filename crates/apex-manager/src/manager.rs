//! The host-facing façade: one [`Session`] per sandbox, a typed command
//! surface, and an event stream for subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use apex_protocol::{agent, slugify, AgentMode, BridgeEvent, Command};

use crate::connection::{self, BridgeConnection};
use crate::error::{ManagerError, Result};
use crate::events::ManagerEvent;
use crate::platform::{PlatformClient, PreviewInfo, SandboxInfo, SshAccess};
use crate::reconnect::SingleFlight;
use crate::session::{Session, SessionStatus};
use crate::{files, git, layout, shell};

const SANDBOX_HOME: &str = "/home/daytona";
const BRIDGE_DIR: &str = "/home/daytona/bridge";
const BRIDGE_PORT: u16 = 8080;
const CODE_SERVER_PORT: u16 = 9090;

/// Sandbox handles resolved through the platform are cached this long.
const SANDBOX_CACHE_TTL: Duration = Duration::from_secs(60);
/// A "confirmed started" observation is trusted this long.
const STARTED_TTL: Duration = Duration::from_secs(30);
/// Hard cap on a full reconnect, fast paths included.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const BRIDGE_WAIT_ATTEMPTS: u32 = 10;
const BRIDGE_WAIT_DELAY: Duration = Duration::from_millis(1500);
const WS_RETRY_BACKOFF: Duration = Duration::from_millis(500);

const BRIDGE_PROBE: &str = "curl -sf http://localhost:8080/";

/// Behavioural note installed for the agent: preview URLs come from the
/// terminal tool server, never from guessing at localhost.
const CLAUDE_MD: &str = "\
# Working in this sandbox

This project runs inside a remote sandbox. When you start a dev server and
want to share it, call the `get_preview_url` tool with the port number and
share the URL it returns. Never share `localhost` or `127.0.0.1` links;
they do not resolve outside the sandbox.
";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Platform API base URL.
    pub api_url: String,
    /// Platform API bearer token.
    pub api_key: String,
    /// Injected into the bridge environment for the agent CLI.
    pub anthropic_api_key: String,
    /// Local path of the prebuilt bridge binary to upload.
    pub bridge_binary: PathBuf,
    /// Local path of the prebuilt MCP terminal adapter to upload.
    pub mcp_binary: PathBuf,
    /// Also start code-server on port 9090 inside new sandboxes.
    pub start_code_server: bool,
}

// ---------------------------------------------------------------------------
// SandboxManager
// ---------------------------------------------------------------------------

pub struct SandboxManager {
    config: ManagerConfig,
    platform: PlatformClient,
    sessions: Mutex<HashMap<String, Session>>,
    reconnects: SingleFlight,
    sandbox_cache: Mutex<HashMap<String, (SandboxInfo, Instant)>>,
    started_at: Mutex<HashMap<String, Instant>>,
    project_names: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SandboxManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let platform = PlatformClient::new(config.api_url.clone(), config.api_key.clone());
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            platform,
            sessions: Mutex::new(HashMap::new()),
            reconnects: SingleFlight::new(),
            sandbox_cache: Mutex::new(HashMap::new()),
            started_at: Mutex::new(HashMap::new()),
            project_names: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn platform(&self) -> &PlatformClient {
        &self.platform
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    // ── Session bookkeeping ──────────────────────────────────────────────

    fn set_status(&self, sandbox_id: &str, status: SessionStatus, error: Option<String>) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(sandbox_id) {
                session.status = status;
                session.error = error.clone();
                if matches!(status, SessionStatus::Completed | SessionStatus::Error) {
                    session.ended_at = Some(chrono::Utc::now());
                }
            }
        }
        self.emit(ManagerEvent::Status {
            sandbox_id: sandbox_id.to_string(),
            status,
            error,
        });
    }

    pub fn session_status(&self, sandbox_id: &str) -> Option<SessionStatus> {
        self.sessions
            .lock()
            .unwrap()
            .get(sandbox_id)
            .map(|s| s.status)
    }

    fn connection(&self, sandbox_id: &str) -> Option<BridgeConnection> {
        self.sessions
            .lock()
            .unwrap()
            .get(sandbox_id)
            .and_then(|s| s.connection.clone())
    }

    fn is_connected(&self, sandbox_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(sandbox_id)
            .is_some_and(|s| s.is_connected())
    }

    fn project_dir_for(&self, sandbox_id: &str) -> String {
        if let Some(dir) = self
            .sessions
            .lock()
            .unwrap()
            .get(sandbox_id)
            .map(|s| s.project_dir.clone())
        {
            return dir;
        }
        let name = self
            .project_names
            .lock()
            .unwrap()
            .get(sandbox_id)
            .cloned()
            .unwrap_or_else(|| "project".to_string());
        format!("{SANDBOX_HOME}/{}", slugify(&name))
    }

    /// Create the session entry if this host has never seen the sandbox
    /// (reconnecting after a host restart resurrects it from scratch).
    fn ensure_session_entry(&self, sandbox_id: &str, project_name: Option<String>) {
        if let Some(name) = &project_name {
            self.project_names
                .lock()
                .unwrap()
                .insert(sandbox_id.to_string(), name.clone());
        }
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(sandbox_id) {
            let name = project_name.unwrap_or_else(|| {
                self.project_names
                    .lock()
                    .unwrap()
                    .get(sandbox_id)
                    .cloned()
                    .unwrap_or_else(|| "project".to_string())
            });
            let dir = format!("{SANDBOX_HOME}/{}", slugify(&name));
            sessions.insert(
                sandbox_id.to_string(),
                Session::new(sandbox_id.to_string(), name, dir),
            );
        }
    }

    // ── Bring-up ─────────────────────────────────────────────────────────

    /// Create a sandbox, install and start the bridge, connect. Returns the
    /// new sandbox id. Status events track each phase.
    pub async fn create_sandbox(
        self: &Arc<Self>,
        snapshot: &str,
        project_name: Option<String>,
        git_repo: Option<String>,
    ) -> Result<String> {
        let info = self
            .platform
            .create(snapshot)
            .await
            .map_err(|e| ManagerError::SandboxStart(e.to_string()))?;
        let sandbox_id = info.id.clone();

        let name = project_name.unwrap_or_else(|| "project".to_string());
        let project_dir = format!("{SANDBOX_HOME}/{}", slugify(&name));
        {
            self.project_names
                .lock()
                .unwrap()
                .insert(sandbox_id.clone(), name.clone());
            self.sandbox_cache
                .lock()
                .unwrap()
                .insert(sandbox_id.clone(), (info, Instant::now()));
            self.started_at
                .lock()
                .unwrap()
                .insert(sandbox_id.clone(), Instant::now());
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                sandbox_id.clone(),
                Session::new(sandbox_id.clone(), name, project_dir.clone()),
            );
        }
        self.emit(ManagerEvent::Status {
            sandbox_id: sandbox_id.clone(),
            status: SessionStatus::Creating,
            error: None,
        });

        match self
            .bring_up(&sandbox_id, &project_dir, git_repo.as_deref())
            .await
        {
            Ok(()) => Ok(sandbox_id),
            Err(err) => {
                self.set_status(&sandbox_id, SessionStatus::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn bring_up(
        self: &Arc<Self>,
        sandbox_id: &str,
        project_dir: &str,
        git_repo: Option<&str>,
    ) -> Result<()> {
        self.set_status(sandbox_id, SessionStatus::CloningRepo, None);
        self.platform
            .exec_checked(
                sandbox_id,
                &format!("mkdir -p {}", shell::quote(project_dir)),
                None,
                Some(15),
            )
            .await?;
        match git_repo {
            Some(repo) => {
                self.platform
                    .exec_checked(
                        sandbox_id,
                        &format!("git clone {} .", shell::quote(repo)),
                        Some(project_dir),
                        Some(600),
                    )
                    .await?;
            }
            None => {
                self.platform
                    .exec_checked(sandbox_id, "git init", Some(project_dir), Some(30))
                    .await?;
            }
        }

        self.set_status(sandbox_id, SessionStatus::StartingBridge, None);
        self.install_bridge(sandbox_id).await?;
        self.install_inotify(sandbox_id).await;
        self.start_bridge(sandbox_id, project_dir).await?;
        self.wait_for_bridge(sandbox_id).await?;

        self.set_status(sandbox_id, SessionStatus::Connecting, None);
        let preview = self.platform.preview_url(sandbox_id, BRIDGE_PORT).await?;
        self.open_connection(sandbox_id, preview).await?;

        self.set_status(sandbox_id, SessionStatus::Running, None);
        Ok(())
    }

    async fn upload_bridge_binary(&self, sandbox_id: &str) -> Result<()> {
        let bytes = tokio::fs::read(&self.config.bridge_binary)
            .await
            .map_err(|e| {
                ManagerError::BridgeInstall(format!(
                    "cannot read {}: {e}",
                    self.config.bridge_binary.display()
                ))
            })?;
        self.platform
            .upload_file(sandbox_id, &format!("{BRIDGE_DIR}/apex-bridge"), bytes)
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        self.platform
            .exec_checked(
                sandbox_id,
                &format!("chmod +x {BRIDGE_DIR}/apex-bridge"),
                None,
                Some(15),
            )
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        Ok(())
    }

    async fn install_bridge(&self, sandbox_id: &str) -> Result<()> {
        self.platform
            .exec_checked(sandbox_id, &format!("mkdir -p {BRIDGE_DIR}"), None, Some(15))
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        self.upload_bridge_binary(sandbox_id).await?;

        let mcp = tokio::fs::read(&self.config.mcp_binary).await.map_err(|e| {
            ManagerError::BridgeInstall(format!(
                "cannot read {}: {e}",
                self.config.mcp_binary.display()
            ))
        })?;
        self.platform
            .upload_file(sandbox_id, &format!("{BRIDGE_DIR}/apex-mcp"), mcp)
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        self.platform
            .exec_checked(
                sandbox_id,
                &format!("chmod +x {BRIDGE_DIR}/apex-mcp && mkdir -p {SANDBOX_HOME}/.claude"),
                None,
                Some(15),
            )
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;

        // Register the terminal tool server with the agent CLI.
        let registration = serde_json::json!({
            "mcpServers": {
                "apex-terminal": {
                    "type": "stdio",
                    "command": format!("{BRIDGE_DIR}/apex-mcp"),
                    "env": { "APEX_BRIDGE_PORT": BRIDGE_PORT.to_string() },
                }
            }
        });
        self.platform
            .upload_file(
                sandbox_id,
                &format!("{SANDBOX_HOME}/.claude.json"),
                serde_json::to_vec_pretty(&registration)?,
            )
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        self.platform
            .upload_file(
                sandbox_id,
                &format!("{SANDBOX_HOME}/.claude/CLAUDE.md"),
                CLAUDE_MD.as_bytes().to_vec(),
            )
            .await
            .map_err(|e| ManagerError::BridgeInstall(e.to_string()))?;
        Ok(())
    }

    /// Best-effort: the file watcher needs inotify-tools; its absence only
    /// disables watching.
    async fn install_inotify(&self, sandbox_id: &str) {
        let command = "which inotifywait || sudo apt-get install -y inotify-tools \
                       || apt-get install -y inotify-tools";
        if let Err(err) = self.platform.exec(sandbox_id, command, None, Some(120)).await {
            tracing::warn!(sandbox_id, "inotify-tools install failed: {err}");
        }
    }

    async fn start_bridge(&self, sandbox_id: &str, project_dir: &str) -> Result<()> {
        // Paired create/delete: drop the previous exec session before
        // starting a replacement bridge under a fresh one.
        let previous = self
            .sessions
            .lock()
            .unwrap()
            .get_mut(sandbox_id)
            .and_then(|s| s.bridge_exec_session.take());
        if let Some(old) = previous {
            if let Err(err) = self.platform.delete_exec_session(sandbox_id, &old).await {
                tracing::debug!(sandbox_id, "stale exec session cleanup failed: {err}");
            }
        }

        let exec_session = format!("bridge-{}", uuid::Uuid::new_v4());
        self.platform
            .create_exec_session(sandbox_id, &exec_session)
            .await?;

        let env = format!(
            "APEX_BRIDGE_PORT={BRIDGE_PORT} APEX_PROJECT_DIR={} \
             DAYTONA_SANDBOX_ID={} DAYTONA_API_URL={} DAYTONA_API_KEY={} \
             ANTHROPIC_API_KEY={}",
            shell::quote(project_dir),
            shell::quote(sandbox_id),
            shell::quote(&self.config.api_url),
            shell::quote(&self.config.api_key),
            shell::quote(&self.config.anthropic_api_key),
        );
        let command = format!("cd {BRIDGE_DIR} && {env} ./apex-bridge >> bridge.log 2>&1");
        self.platform
            .session_exec_detached(sandbox_id, &exec_session, &command)
            .await?;

        if self.config.start_code_server {
            let cs = format!(
                "code-server --bind-addr 0.0.0.0:{CODE_SERVER_PORT} --auth none \
                 >> {BRIDGE_DIR}/code-server.log 2>&1"
            );
            if let Err(err) = self
                .platform
                .session_exec_detached(sandbox_id, &exec_session, &cs)
                .await
            {
                tracing::warn!(sandbox_id, "code-server start failed: {err}");
            }
        }

        if let Some(session) = self.sessions.lock().unwrap().get_mut(sandbox_id) {
            session.bridge_exec_session = Some(exec_session);
        }
        Ok(())
    }

    async fn wait_for_bridge(&self, sandbox_id: &str) -> Result<()> {
        for attempt in 1..=BRIDGE_WAIT_ATTEMPTS {
            match self
                .platform
                .exec(sandbox_id, BRIDGE_PROBE, None, Some(5))
                .await
            {
                Ok(result) if result.exit_code == 0 && result.result.contains("bridge-ok") => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(sandbox_id, attempt, "bridge probe failed: {err}"),
            }
            tokio::time::sleep(BRIDGE_WAIT_DELAY).await;
        }
        let diagnostics = self.collect_diagnostics(sandbox_id).await;
        Err(ManagerError::BridgeUnreachable {
            attempts: BRIDGE_WAIT_ATTEMPTS,
            diagnostics,
        })
    }

    async fn collect_diagnostics(&self, sandbox_id: &str) -> String {
        let mut out = String::new();
        for (label, command) in [
            ("processes", "ps aux | head -40"),
            ("listeners", "ss -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null"),
            ("bridge.log", "tail -50 /home/daytona/bridge/bridge.log"),
        ] {
            let text = match self.platform.exec(sandbox_id, command, None, Some(10)).await {
                Ok(result) => result.result,
                Err(err) => format!("<{err}>"),
            };
            out.push_str(&format!("--- {label} ---\n{text}\n"));
        }
        out
    }

    // ── Connection management ────────────────────────────────────────────

    async fn open_connection(self: &Arc<Self>, sandbox_id: &str, preview: PreviewInfo) -> Result<()> {
        let (conn, events) = connection::connect(&preview.url, &preview.token).await?;
        let epoch = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(sandbox_id)
                .ok_or_else(|| ManagerError::NotConnected(sandbox_id.to_string()))?;
            // Atomic replacement: the old connection handle (if any) is
            // dropped here, and its pump will see a newer epoch.
            session.preview = Some(preview);
            session.connection = Some(conn);
            session.conn_epoch += 1;
            session.connected_once = true;
            session.conn_epoch
        };

        let manager = self.clone();
        let id = sandbox_id.to_string();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                manager.handle_bridge_event(&id, event);
            }
            manager.on_connection_closed(&id, epoch);
        });
        Ok(())
    }

    fn on_connection_closed(&self, sandbox_id: &str, epoch: u64) {
        let was_current = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(sandbox_id) {
                Some(session) if session.conn_epoch == epoch => {
                    session.connection = None;
                    session.status == SessionStatus::Running
                }
                _ => false,
            }
        };
        if was_current {
            self.set_status(
                sandbox_id,
                SessionStatus::Error,
                Some("bridge connection closed".to_string()),
            );
        }
    }

    /// Relay one bridge frame: the raw frame goes out as a `message` event,
    /// then typed projections and session bookkeeping follow.
    pub(crate) fn handle_bridge_event(&self, sandbox_id: &str, event: BridgeEvent) {
        if let Ok(raw) = serde_json::to_value(&event) {
            self.emit(ManagerEvent::Message {
                sandbox_id: sandbox_id.to_string(),
                data: raw,
            });
        }

        match event {
            BridgeEvent::ClaudeMessage { data, .. } => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(session) = sessions.get_mut(sandbox_id) {
                    if agent::is_result(&data) {
                        if let Some(cost) = agent::result_cost_usd(&data) {
                            session.total_cost_usd =
                                Some(session.total_cost_usd.unwrap_or(0.0) + cost);
                        }
                        if let Some(text) = agent::result_text(&data) {
                            session.result = Some(text.to_string());
                        }
                        if let Some(id) = agent::session_id(&data) {
                            session.agent_session_id = Some(id.to_string());
                        }
                    }
                    session.messages.push(data);
                }
            }
            BridgeEvent::ClaudeExit { chat_id, code } => {
                if code != 0 {
                    self.set_status(
                        sandbox_id,
                        SessionStatus::Error,
                        Some(format!("agent for chat {chat_id} exited with code {code}")),
                    );
                }
            }
            BridgeEvent::ClaudeError { chat_id, error } => {
                tracing::warn!(sandbox_id, %chat_id, "agent error: {error}");
            }
            BridgeEvent::TerminalCreated { terminal_id, name } => {
                self.emit(ManagerEvent::TerminalCreated {
                    sandbox_id: sandbox_id.to_string(),
                    terminal_id,
                    name,
                });
            }
            BridgeEvent::TerminalOutput { terminal_id, data } => {
                self.emit(ManagerEvent::TerminalOutput {
                    sandbox_id: sandbox_id.to_string(),
                    terminal_id,
                    data,
                });
            }
            BridgeEvent::TerminalExit { terminal_id, code } => {
                self.emit(ManagerEvent::TerminalExit {
                    sandbox_id: sandbox_id.to_string(),
                    terminal_id,
                    code,
                });
            }
            BridgeEvent::TerminalError { terminal_id, error } => {
                self.emit(ManagerEvent::TerminalError {
                    sandbox_id: sandbox_id.to_string(),
                    terminal_id,
                    error,
                });
            }
            BridgeEvent::TerminalList { terminals } => {
                self.emit(ManagerEvent::TerminalList {
                    sandbox_id: sandbox_id.to_string(),
                    terminals,
                });
            }
            BridgeEvent::FileChanged { dirs } => {
                self.emit(ManagerEvent::FileChanged {
                    sandbox_id: sandbox_id.to_string(),
                    dirs,
                });
            }
            BridgeEvent::PortsUpdate { ports } => {
                self.emit(ManagerEvent::PortsUpdate {
                    sandbox_id: sandbox_id.to_string(),
                    ports,
                });
            }
            BridgeEvent::BridgeReady { port } => {
                tracing::debug!(sandbox_id, port, "bridge ready");
            }
            BridgeEvent::Pong | BridgeEvent::Unknown => {}
        }
    }

    // ── Reconnection ─────────────────────────────────────────────────────

    /// Reconnect to a sandbox's bridge. Idempotent: a healthy connection is
    /// a no-op, and concurrent callers for the same sandbox share one
    /// in-flight reconnect. Hard 30 s cap.
    pub async fn reconnect_sandbox(
        self: &Arc<Self>,
        sandbox_id: &str,
        project_name: Option<String>,
    ) -> Result<()> {
        if self.is_connected(sandbox_id) {
            return Ok(());
        }
        let this = self.clone();
        let id = sandbox_id.to_string();
        self.reconnects
            .run(sandbox_id, move || async move {
                match tokio::time::timeout(RECONNECT_TIMEOUT, this.do_reconnect(&id, project_name))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ManagerError::ReconnectTimeout(id.clone())),
                }
            })
            .await
            .map_err(ManagerError::Shared)
    }

    async fn do_reconnect(
        self: &Arc<Self>,
        sandbox_id: &str,
        project_name: Option<String>,
    ) -> Result<()> {
        // Another caller may have finished while we queued.
        if self.is_connected(sandbox_id) {
            return Ok(());
        }

        self.cached_sandbox(sandbox_id).await?;
        self.ensure_session_entry(sandbox_id, project_name);
        self.ensure_started(sandbox_id).await?;
        self.set_status(sandbox_id, SessionStatus::Connecting, None);

        // Re-upload runs in parallel with the preview fetch; both are on the
        // critical path of every reconnect.
        let (upload, preview) = tokio::join!(
            self.upload_bridge_binary(sandbox_id),
            self.platform.preview_url(sandbox_id, BRIDGE_PORT),
        );
        upload?;
        let preview = preview?;

        self.connect_with_retry(sandbox_id, preview).await?;
        self.set_status(sandbox_id, SessionStatus::Running, None);
        Ok(())
    }

    async fn cached_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        if let Some((info, at)) = self.sandbox_cache.lock().unwrap().get(sandbox_id) {
            if at.elapsed() < SANDBOX_CACHE_TTL {
                return Ok(info.clone());
            }
        }
        let info = self.platform.get(sandbox_id).await?;
        self.sandbox_cache
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), (info.clone(), Instant::now()));
        Ok(info)
    }

    async fn ensure_started(&self, sandbox_id: &str) -> Result<()> {
        let recently_started = self
            .started_at
            .lock()
            .unwrap()
            .get(sandbox_id)
            .is_some_and(|at| at.elapsed() < STARTED_TTL);
        if self.is_connected(sandbox_id) || recently_started {
            return Ok(());
        }

        let info = self.platform.get(sandbox_id).await?;
        if !info.is_started() {
            self.platform
                .start(sandbox_id, 60)
                .await
                .map_err(|e| ManagerError::SandboxStart(e.to_string()))?;
        }
        self.sandbox_cache
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), (info, Instant::now()));
        self.started_at
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), Instant::now());
        Ok(())
    }

    async fn bridge_alive(&self, sandbox_id: &str) -> bool {
        matches!(
            self.platform.exec(sandbox_id, BRIDGE_PROBE, None, Some(5)).await,
            Ok(result) if result.exit_code == 0 && result.result.contains("bridge-ok")
        )
    }

    async fn connect_with_retry(self: &Arc<Self>, sandbox_id: &str, preview: PreviewInfo) -> Result<()> {
        let first_connect = !self
            .sessions
            .lock()
            .unwrap()
            .get(sandbox_id)
            .is_some_and(|s| s.connected_once);

        // First connect always restarts so a reconnect after a host-process
        // restart runs the bridge build this host shipped with.
        if first_connect || !self.bridge_alive(sandbox_id).await {
            let preview = self.restart_bridge(sandbox_id).await?;
            return self.open_connection(sandbox_id, preview).await;
        }

        let mut preview = preview;
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(WS_RETRY_BACKOFF).await;
                preview = self.platform.preview_url(sandbox_id, BRIDGE_PORT).await?;
            }
            match self.open_connection(sandbox_id, preview.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(sandbox_id, attempt, "ws connect failed: {err}");
                    last_err = Some(err);
                }
            }
        }

        // Both direct attempts failed: one bridge restart, one last try.
        tracing::info!(
            sandbox_id,
            "restarting bridge after connect failures: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        );
        let preview = self.restart_bridge(sandbox_id).await?;
        self.open_connection(sandbox_id, preview).await
    }

    async fn restart_bridge(&self, sandbox_id: &str) -> Result<PreviewInfo> {
        let _ = self
            .platform
            .exec(sandbox_id, "pkill -f apex-bridge || true", None, Some(10))
            .await;
        self.upload_bridge_binary(sandbox_id).await?;
        let project_dir = self.project_dir_for(sandbox_id);
        self.start_bridge(sandbox_id, &project_dir).await?;
        self.wait_for_bridge(sandbox_id).await?;
        Ok(self.platform.preview_url(sandbox_id, BRIDGE_PORT).await?)
    }

    /// The single gate every bridge command goes through; drives a reconnect
    /// when the socket is down and fails loudly when that fails.
    async fn ensure_connected(self: &Arc<Self>, sandbox_id: &str) -> Result<BridgeConnection> {
        if let Some(conn) = self.connection(sandbox_id) {
            if conn.is_open() {
                return Ok(conn);
            }
        }
        self.reconnect_sandbox(sandbox_id, None).await?;
        self.connection(sandbox_id)
            .filter(|c| c.is_open())
            .ok_or_else(|| ManagerError::NotConnected(sandbox_id.to_string()))
    }

    // ── Agent commands ───────────────────────────────────────────────────

    /// Send a prompt to a chat; returns the chat id used (a fresh UUID when
    /// the caller did not pick one).
    pub async fn send_prompt(
        self: &Arc<Self>,
        sandbox_id: &str,
        prompt: &str,
        chat_id: Option<String>,
        session_id: Option<String>,
        mode: Option<AgentMode>,
        model: Option<String>,
    ) -> Result<String> {
        let conn = self.ensure_connected(sandbox_id).await?;
        let chat_id = chat_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        conn.send(&Command::StartClaude {
            chat_id: chat_id.clone(),
            prompt: prompt.to_string(),
            mode: mode.unwrap_or_default(),
            model,
            session_id,
        })?;
        Ok(chat_id)
    }

    pub async fn stop_claude(self: &Arc<Self>, sandbox_id: &str, chat_id: Option<String>) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::StopClaude { chat_id })
    }

    pub async fn send_user_answer(
        self: &Arc<Self>,
        sandbox_id: &str,
        chat_id: &str,
        tool_use_id: &str,
        answer: &str,
    ) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::ClaudeUserAnswer {
            chat_id: chat_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            answer: answer.to_string(),
        })
    }

    // ── Terminal commands ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_terminal(
        self: &Arc<Self>,
        sandbox_id: &str,
        terminal_id: &str,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<String>,
        command: Option<String>,
    ) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::TerminalCreate {
            terminal_id: terminal_id.to_string(),
            name: name.to_string(),
            cols,
            rows,
            cwd,
            command,
        })
    }

    pub async fn send_terminal_input(
        self: &Arc<Self>,
        sandbox_id: &str,
        terminal_id: &str,
        data: &str,
    ) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::TerminalInput {
            terminal_id: terminal_id.to_string(),
            data: data.to_string(),
        })
    }

    pub async fn resize_terminal(
        self: &Arc<Self>,
        sandbox_id: &str,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::TerminalResize {
            terminal_id: terminal_id.to_string(),
            cols,
            rows,
        })
    }

    pub async fn close_terminal(self: &Arc<Self>, sandbox_id: &str, terminal_id: &str) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::TerminalClose {
            terminal_id: terminal_id.to_string(),
        })
    }

    /// Request a terminal snapshot; the reply arrives as a `terminal_list`
    /// event.
    pub async fn list_terminals(self: &Arc<Self>, sandbox_id: &str) -> Result<()> {
        let conn = self.ensure_connected(sandbox_id).await?;
        conn.send(&Command::TerminalList)
    }

    // ── Platform-mediated operations (no WS required) ────────────────────

    /// Make sure the sandbox exists and is started; used by every operation
    /// that goes through the platform instead of the bridge.
    async fn ensure_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.cached_sandbox(sandbox_id).await?;
        self.ensure_started(sandbox_id).await
    }

    pub async fn get_vscode_url(&self, sandbox_id: &str) -> Result<String> {
        self.ensure_sandbox(sandbox_id).await?;
        Ok(self
            .platform
            .preview_url(sandbox_id, CODE_SERVER_PORT)
            .await?
            .url)
    }

    pub async fn create_ssh_access(&self, sandbox_id: &str) -> Result<SshAccess> {
        self.ensure_sandbox(sandbox_id).await?;
        self.platform.ssh_access(sandbox_id).await
    }

    pub async fn get_port_preview_url(&self, sandbox_id: &str, port: u16) -> Result<PreviewInfo> {
        self.ensure_sandbox(sandbox_id).await?;
        self.platform.preview_url(sandbox_id, port).await
    }

    async fn git_root(&self, sandbox_id: &str) -> Result<String> {
        self.ensure_sandbox(sandbox_id).await?;
        let dir = self.project_dir_for(sandbox_id);
        git::find_git_root(&self.platform, sandbox_id, &dir).await
    }

    pub async fn git_status(&self, sandbox_id: &str) -> Result<git::GitStatus> {
        let root = self.git_root(sandbox_id).await?;
        git::status(&self.platform, sandbox_id, &root).await
    }

    pub async fn git_branches(&self, sandbox_id: &str) -> Result<Vec<git::GitBranch>> {
        let root = self.git_root(sandbox_id).await?;
        git::branches(&self.platform, sandbox_id, &root).await
    }

    pub async fn git_stage(&self, sandbox_id: &str, paths: &[String]) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::stage(&self.platform, sandbox_id, &root, paths).await
    }

    pub async fn git_unstage(&self, sandbox_id: &str, paths: &[String]) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::unstage(&self.platform, sandbox_id, &root, paths).await
    }

    pub async fn git_discard(&self, sandbox_id: &str, paths: &[String]) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::discard(&self.platform, sandbox_id, &root, paths).await
    }

    pub async fn git_commit(&self, sandbox_id: &str, message: &str) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::commit(&self.platform, sandbox_id, &root, message).await
    }

    pub async fn git_push(&self, sandbox_id: &str) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::push(&self.platform, sandbox_id, &root).await
    }

    pub async fn git_pull(&self, sandbox_id: &str) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::pull(&self.platform, sandbox_id, &root).await
    }

    pub async fn git_checkout(&self, sandbox_id: &str, branch: &str) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::checkout(&self.platform, sandbox_id, &root, branch).await
    }

    pub async fn git_create_branch(&self, sandbox_id: &str, branch: &str) -> Result<()> {
        let root = self.git_root(sandbox_id).await?;
        git::create_branch(&self.platform, sandbox_id, &root, branch).await
    }

    pub async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<files::DirEntry>> {
        self.ensure_sandbox(sandbox_id).await?;
        files::list_dir(&self.platform, sandbox_id, path).await
    }

    pub async fn create_file(&self, sandbox_id: &str, path: &str) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        files::create_file(&self.platform, sandbox_id, path).await
    }

    pub async fn make_dir(&self, sandbox_id: &str, path: &str) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        files::make_dir(&self.platform, sandbox_id, path).await
    }

    pub async fn rename_path(&self, sandbox_id: &str, from: &str, to: &str) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        files::rename(&self.platform, sandbox_id, from, to).await
    }

    pub async fn delete_path(&self, sandbox_id: &str, path: &str) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        files::remove(&self.platform, sandbox_id, path).await
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        self.ensure_sandbox(sandbox_id).await?;
        files::read_file(&self.platform, sandbox_id, path).await
    }

    pub async fn write_file(&self, sandbox_id: &str, path: &str, content: Vec<u8>) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        files::write_file(&self.platform, sandbox_id, path, content).await
    }

    pub async fn search_content(
        &self,
        sandbox_id: &str,
        query: &str,
        include: Option<&[String]>,
    ) -> Result<Vec<files::SearchMatch>> {
        self.ensure_sandbox(sandbox_id).await?;
        let dir = self.project_dir_for(sandbox_id);
        files::search(&self.platform, sandbox_id, &dir, query, include).await
    }

    pub async fn save_layout(&self, sandbox_id: &str, layout: &serde_json::Value) -> Result<()> {
        self.ensure_sandbox(sandbox_id).await?;
        layout::save_layout(&self.platform, sandbox_id, layout).await
    }

    pub async fn load_layout(&self, sandbox_id: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_sandbox(sandbox_id).await?;
        layout::load_layout(&self.platform, sandbox_id).await
    }

    // ── Fork / stop / delete ─────────────────────────────────────────────

    /// Fork a sandbox copy-on-write and start work on a fresh branch in the
    /// fork. Returns the forked sandbox id.
    pub async fn fork_sandbox(
        self: &Arc<Self>,
        source_sandbox_id: &str,
        branch_name: &str,
        project_name: Option<String>,
    ) -> Result<String> {
        let info = self
            .platform
            .fork(source_sandbox_id)
            .await
            .map_err(|e| ManagerError::SandboxStart(e.to_string()))?;
        let forked_id = info.id.clone();

        let name = project_name.or_else(|| {
            self.project_names
                .lock()
                .unwrap()
                .get(source_sandbox_id)
                .cloned()
        });
        self.sandbox_cache
            .lock()
            .unwrap()
            .insert(forked_id.clone(), (info, Instant::now()));

        self.reconnect_sandbox(&forked_id, name).await?;

        let dir = self.project_dir_for(&forked_id);
        let root = git::find_git_root(&self.platform, &forked_id, &dir).await?;
        git::create_branch(&self.platform, &forked_id, &root, branch_name).await?;
        Ok(forked_id)
    }

    pub async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.platform.stop(sandbox_id).await?;
        self.started_at.lock().unwrap().remove(sandbox_id);
        self.sandbox_cache.lock().unwrap().remove(sandbox_id);
        self.set_status(sandbox_id, SessionStatus::Completed, None);
        Ok(())
    }

    /// Tear down everything we hold for the sandbox, then delete it.
    /// Disposers run in reverse acquisition order: connection, exec
    /// session, session entry, caches, platform resource.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let exec_session = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .remove(sandbox_id)
                .and_then(|s| s.bridge_exec_session)
        };
        if let Some(exec_session) = exec_session {
            if let Err(err) = self
                .platform
                .delete_exec_session(sandbox_id, &exec_session)
                .await
            {
                tracing::debug!(sandbox_id, "exec session cleanup failed: {err}");
            }
        }
        self.sandbox_cache.lock().unwrap().remove(sandbox_id);
        self.started_at.lock().unwrap().remove(sandbox_id);
        self.project_names.lock().unwrap().remove(sandbox_id);
        self.platform.delete(sandbox_id).await
    }

    // ── Test hooks ───────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn insert_test_session(&self, sandbox_id: &str) {
        self.ensure_session_entry(sandbox_id, Some("test".into()));
    }

    #[cfg(test)]
    pub(crate) fn with_session<R>(
        &self,
        sandbox_id: &str,
        f: impl FnOnce(&Session) -> R,
    ) -> Option<R> {
        self.sessions.lock().unwrap().get(sandbox_id).map(f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
