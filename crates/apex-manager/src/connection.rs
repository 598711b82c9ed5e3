//! The host side of the per-sandbox WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use apex_protocol::{BridgeEvent, Command};

use crate::error::{ManagerError, Result};

/// Per-attempt cap on the WebSocket upgrade.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL derivation
// ---------------------------------------------------------------------------

/// Turn the platform's signed preview URL into the WebSocket URL for the
/// upgrade (`https://…` → `wss://…`).
pub fn ws_url_from_preview(preview_url: &str) -> String {
    if let Some(rest) = preview_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = preview_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        preview_url.to_string()
    }
}

// ---------------------------------------------------------------------------
// BridgeConnection
// ---------------------------------------------------------------------------

/// A live connection to one bridge. Cheap to clone; the socket itself lives
/// in two background tasks (reader and writer).
#[derive(Clone)]
pub struct BridgeConnection {
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl BridgeConnection {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue a command frame. Fails when the socket has gone away.
    pub fn send(&self, command: &Command) -> Result<()> {
        let frame = serde_json::to_string(command)?;
        if !self.is_open() || self.tx.send(frame).is_err() {
            return Err(ManagerError::NotConnected("<closed>".into()));
        }
        Ok(())
    }

    /// Test hook: a connection backed by a bare channel instead of a socket.
    #[cfg(test)]
    pub(crate) fn for_test() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

/// Open the WebSocket to a bridge through the preview proxy.
///
/// Returns the connection handle and the stream of parsed bridge events;
/// the receiver closes when the socket does.
pub async fn connect(
    preview_url: &str,
    preview_token: &str,
) -> Result<(BridgeConnection, mpsc::UnboundedReceiver<BridgeEvent>)> {
    let ws_url = ws_url_from_preview(preview_url);
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| ManagerError::Platform(format!("bad preview URL: {e}")))?;
    // The preview proxy requires both headers on the upgrade.
    request.headers_mut().insert(
        "X-Daytona-Skip-Preview-Warning",
        HeaderValue::from_static("true"),
    );
    request.headers_mut().insert(
        "x-daytona-preview-token",
        HeaderValue::from_str(preview_token)
            .map_err(|e| ManagerError::Platform(format!("bad preview token: {e}")))?,
    );

    let (socket, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| ManagerError::WsHandshake {
            status: 0,
            body: "connect timed out".into(),
        })?
        .map_err(|err| match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                ManagerError::WsHandshake { status, body }
            }
            other => ManagerError::WsHandshake {
                status: 0,
                body: other.to_string(),
            },
        })?;

    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<BridgeEvent>();
    let open = Arc::new(AtomicBool::new(true));

    let writer_open = open.clone();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        writer_open.store(false, Ordering::SeqCst);
    });

    let reader_open = open.clone();
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<BridgeEvent>(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break; // consumer gone
                            }
                        }
                        Err(err) => tracing::warn!("dropping unparseable bridge frame: {err}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        // event_tx drops here, closing the consumer's receiver.
    });

    Ok((
        BridgeConnection {
            tx: frame_tx,
            open,
        },
        event_rx,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
