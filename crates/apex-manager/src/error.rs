use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("sandbox start failed: {0}")]
    SandboxStart(String),

    #[error("bridge install failed: {0}")]
    BridgeInstall(String),

    #[error("bridge unreachable after {attempts} probes; diagnostics:\n{diagnostics}")]
    BridgeUnreachable { attempts: u32, diagnostics: String },

    #[error("reconnect timed out for sandbox {0}")]
    ReconnectTimeout(String),

    #[error("websocket handshake failed: HTTP {status}: {body}")]
    WsHandshake { status: u16, body: String },

    #[error("no bridge connection for sandbox {0}")]
    NotConnected(String),

    #[error("no git repository found under {0}")]
    GitNoRepo(String),

    #[error("platform API error: {0}")]
    Platform(String),

    #[error("command failed with exit code {code}: {output}")]
    CommandFailed { code: i32, output: String },

    /// A deduplicated reconnect that failed for every subscribed caller.
    #[error("{0}")]
    Shared(Arc<ManagerError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
