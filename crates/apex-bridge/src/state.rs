use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::ChildKiller;
use tokio::sync::{mpsc, oneshot};

use apex_protocol::BridgeEvent;

use crate::terminal::Terminal;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the bridge, resolved from CLI flags and the
/// environment variables the orchestrator injects at launch.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Port the HTTP + WebSocket listener binds to.
    pub port: u16,
    /// The agent's working directory (the cloned project).
    pub project_dir: PathBuf,
    /// Sandbox id, used for the preview-URL proxy route.
    pub sandbox_id: String,
    /// Platform API base URL (`DAYTONA_API_URL`).
    pub api_url: String,
    /// Platform bearer token (`DAYTONA_API_KEY`).
    pub api_key: String,
    /// Ports the scanner never reports besides the bridge's own.
    pub skip_ports: Vec<u16>,
}

impl BridgeConfig {
    /// Ports that must never appear in `ports_update`.
    pub fn scanner_skip_ports(&self) -> Vec<u16> {
        let mut ports = self.skip_ports.clone();
        ports.push(self.port);
        ports
    }
}

// ---------------------------------------------------------------------------
// Per-process handles
// ---------------------------------------------------------------------------

/// A live agent CLI process for one chat. The PTY reader/waiter task owns the
/// child; this handle carries what command dispatch needs.
pub struct AgentHandle {
    pub writer: Mutex<Box<dyn Write + Send>>,
    pub killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

/// The single attached orchestrator connection.
pub struct WsClient {
    /// Serialised frames queued for the socket writer task.
    pub tx: mpsc::UnboundedSender<String>,
    /// Connection generation; lets a superseded reader recognise itself.
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// BridgeState
// ---------------------------------------------------------------------------

/// Shared state for the whole bridge process.
///
/// All maps are single-owner (this process); locks are held only for map
/// access and PTY writes, never across awaits.
pub struct BridgeState {
    pub config: BridgeConfig,
    pub agents: Mutex<HashMap<String, Arc<AgentHandle>>>,
    pub terminals: Mutex<HashMap<String, Arc<Terminal>>>,
    /// Ask-user rendezvous: questionId → waiting HTTP handler.
    pub pending_ask: Mutex<HashMap<String, oneshot::Sender<String>>>,
    /// The most recently started chat; `"default"` ask-user calls attach here.
    pub last_chat: Mutex<Option<String>>,
    client: Mutex<Option<WsClient>>,
    conn_seq: AtomicU64,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            agents: Mutex::new(HashMap::new()),
            terminals: Mutex::new(HashMap::new()),
            pending_ask: Mutex::new(HashMap::new()),
            last_chat: Mutex::new(None),
            client: Mutex::new(None),
            conn_seq: AtomicU64::new(0),
        })
    }

    /// Install a new orchestrator connection, replacing any previous one.
    /// Returns the generation assigned to it.
    pub fn attach_client(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let mut client = self.client.lock().unwrap();
        // Assigned under the lock so a racing pair of upgrades cannot store
        // the older generation last.
        let generation = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *client = Some(WsClient { tx, generation });
        generation
    }

    /// Drop the client slot if `generation` is still the active connection.
    /// Returns `true` when the caller was the active connection (i.e. the
    /// host went away rather than being replaced).
    pub fn detach_client(&self, generation: u64) -> bool {
        let mut client = self.client.lock().unwrap();
        match client.as_ref() {
            Some(c) if c.generation == generation => {
                *client = None;
                true
            }
            _ => false,
        }
    }

    /// Send an event to the attached orchestrator, if any. Output produced
    /// with no client attached is dropped here (scrollback still retains
    /// terminal output up to the ring cap).
    pub fn send_event(&self, event: &BridgeEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(err) => {
                tracing::error!("failed to serialise event: {err}");
                return;
            }
        };
        let client = self.client.lock().unwrap();
        if let Some(c) = client.as_ref() {
            let _ = c.tx.send(frame);
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.lock().unwrap().is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
