//! `apex-protocol`: the wire protocol between the Apex orchestrator and the
//! in-sandbox bridge.
//!
//! One JSON object per WebSocket message, discriminated by `"type"`. The host
//! sends [`Command`] frames down; the bridge sends [`BridgeEvent`] frames up.
//! Unknown frame types deserialize to the `Unknown` arm and are ignored by
//! both sides, so either end can be upgraded first.
//!
//! Agent stream-JSON records stay opaque (`serde_json::Value`) end to end;
//! [`agent`] provides builders for the few records the bridge writes into the
//! agent's stdin and accessors for the few fields the host reads back out.

pub mod agent;
pub mod ansi;
pub mod slug;
pub mod wire;

pub use agent::StreamJsonParser;
pub use ansi::strip_ansi;
pub use slug::slugify;
pub use wire::{AgentMode, BridgeEvent, Command, PortRow, TerminalInfo};
