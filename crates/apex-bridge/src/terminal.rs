use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};

use apex_protocol::{BridgeEvent, TerminalInfo};

use crate::state::BridgeState;

/// Ring cap for retained output chunks per terminal.
pub const SCROLLBACK_CAP: usize = 5000;

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

/// One PTY session in the sandbox, host- or agent-created.
///
/// Output is retained in a bounded ring and relayed live whenever an
/// orchestrator connection is attached; with no connection only the ring
/// survives.
pub struct Terminal {
    pub id: String,
    pub name: String,
    size: Mutex<(u16, u16)>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    scrollback: Mutex<VecDeque<String>>,
}

impl Terminal {
    pub fn write(&self, data: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data.as_bytes())?;
        writer.flush()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("resize failed: {e}"))?;
        *self.size.lock().unwrap() = (cols, rows);
        Ok(())
    }

    pub fn kill(&self) {
        let _ = self.killer.lock().unwrap().kill();
    }

    fn push_chunk(&self, chunk: String) {
        let mut ring = self.scrollback.lock().unwrap();
        if ring.len() == SCROLLBACK_CAP {
            ring.pop_front();
        }
        ring.push_back(chunk);
    }

    /// The last `limit` retained chunks joined into one string; all of them
    /// when `limit` is `None`.
    pub fn read_scrollback(&self, limit: Option<usize>) -> String {
        let ring = self.scrollback.lock().unwrap();
        let skip = match limit {
            Some(n) => ring.len().saturating_sub(n),
            None => 0,
        };
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.lock().unwrap().len()
    }

    pub fn info(&self) -> TerminalInfo {
        let (cols, rows) = *self.size.lock().unwrap();
        TerminalInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            cols,
            rows,
            scrollback: self.read_scrollback(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Spawn a terminal PTY and register it. Duplicate ids are rejected without
/// touching the existing terminal.
pub fn create_terminal(
    state: &Arc<BridgeState>,
    id: String,
    name: String,
    cols: u16,
    rows: u16,
    cwd: Option<String>,
    command: Option<String>,
) -> anyhow::Result<()> {
    {
        let terminals = state.terminals.lock().unwrap();
        if terminals.contains_key(&id) {
            anyhow::bail!("terminal already exists: {id}");
        }
    }

    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("openpty failed: {e}"))?;

    let mut cmd = match command {
        Some(script) => {
            let mut c = CommandBuilder::new("bash");
            c.arg("-c");
            c.arg(script);
            c
        }
        None => CommandBuilder::new(std::env::var("SHELL").unwrap_or_else(|_| "bash".into())),
    };
    cmd.env("TERM", "xterm-256color");
    let dir = cwd.unwrap_or_else(|| state.config.project_dir.display().to_string());
    cmd.cwd(dir);

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("spawn failed: {e}"))?;
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

    let terminal = Arc::new(Terminal {
        id: id.clone(),
        name: name.clone(),
        size: Mutex::new((cols, rows)),
        master: Mutex::new(pair.master),
        writer: Mutex::new(writer),
        killer: Mutex::new(killer),
        scrollback: Mutex::new(VecDeque::new()),
    });

    {
        // Re-check under the lock; a concurrent create for the same id must
        // never clobber the winner.
        let mut terminals = state.terminals.lock().unwrap();
        if terminals.contains_key(&id) {
            terminal.kill();
            anyhow::bail!("terminal already exists: {id}");
        }
        terminals.insert(id.clone(), terminal.clone());
    }
    state.send_event(&BridgeEvent::TerminalCreated {
        terminal_id: id.clone(),
        name,
    });

    // Reader/waiter task: relay output, then reap on PTY exit.
    let state = state.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    terminal.push_chunk(chunk.clone());
                    state.send_event(&BridgeEvent::TerminalOutput {
                        terminal_id: id.clone(),
                        data: chunk,
                    });
                }
            }
        }
        let code = child
            .wait()
            .map(|status| status.exit_code() as i32)
            .unwrap_or(-1);
        state.terminals.lock().unwrap().remove(&id);
        state.send_event(&BridgeEvent::TerminalExit {
            terminal_id: id,
            code,
        });
    });

    Ok(())
}

pub fn get_terminal(state: &BridgeState, id: &str) -> Option<Arc<Terminal>> {
    state.terminals.lock().unwrap().get(id).cloned()
}

/// Snapshot of every live terminal, sorted by id for stable output.
pub fn list_terminals(state: &BridgeState) -> Vec<TerminalInfo> {
    let mut infos: Vec<TerminalInfo> = state
        .terminals
        .lock()
        .unwrap()
        .values()
        .map(|t| t.info())
        .collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));
    infos
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
