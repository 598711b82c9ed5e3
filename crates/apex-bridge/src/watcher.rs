use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use apex_protocol::BridgeEvent;

use crate::state::BridgeState;

/// Events are coalesced per debounce window so a burst of writes becomes one
/// `file_changed` frame.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Subtrees that never produce change events.
const EXCLUDED: &[&str] = &[".git", "node_modules"];

// ---------------------------------------------------------------------------
// Event reduction
// ---------------------------------------------------------------------------

/// Reduce one `inotifywait --format %w%f` line to the project-relative
/// directory it touched, or `None` when it falls in an excluded subtree.
/// The project root itself reduces to `"."`.
pub fn reduce_to_dir(path: &str, root: &Path) -> Option<String> {
    let full = Path::new(path);
    let dir = full.parent().unwrap_or(full);
    let rel = dir.strip_prefix(root).unwrap_or(dir);

    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if EXCLUDED.contains(&name.as_ref()) {
            return None;
        }
    }

    let rel = rel.to_string_lossy();
    if rel.is_empty() {
        Some(".".to_string())
    } else {
        Some(rel.into_owned())
    }
}

// ---------------------------------------------------------------------------
// Watcher task
// ---------------------------------------------------------------------------

/// Start the file watcher if `inotifywait` is available. Absence is a soft
/// failure: log once, everything else keeps working.
pub fn spawn_watcher(state: Arc<BridgeState>) {
    if which::which("inotifywait").is_err() {
        tracing::warn!("inotifywait not found; file watching disabled");
        return;
    }
    tokio::spawn(async move {
        if let Err(err) = run_watcher(state).await {
            tracing::warn!("file watcher stopped: {err}");
        }
    });
}

async fn run_watcher(state: Arc<BridgeState>) -> anyhow::Result<()> {
    let root = state.config.project_dir.clone();
    let mut child = Command::new("inotifywait")
        .args([
            "-mr",
            "-e",
            "create,modify,delete,move",
            "--exclude",
            r"/(\.git|node_modules)/",
            "--format",
            "%w%f",
        ])
        .arg(&root)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("inotifywait stdout not captured"))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(path) => {
                    if let Some(dir) = reduce_to_dir(&path, &root) {
                        if pending.is_empty() {
                            deadline = Instant::now() + DEBOUNCE;
                        }
                        pending.insert(dir);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if !pending.is_empty() => {
                let dirs: Vec<String> = std::mem::take(&mut pending).into_iter().collect();
                state.send_event(&BridgeEvent::FileChanged { dirs });
            }
        }
    }

    // Flush whatever the last window collected.
    if !pending.is_empty() {
        let dirs: Vec<String> = pending.into_iter().collect();
        state.send_event(&BridgeEvent::FileChanged { dirs });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
