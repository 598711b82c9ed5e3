//! Stream-JSON plumbing for the agent CLI.
//!
//! Records from `claude --output-format stream-json` are treated as opaque
//! [`serde_json::Value`]s and relayed verbatim; only the handful of fields
//! the orchestrator actually consumes get accessors here. Records going the
//! other way (into `--input-format stream-json` stdin) are built by the
//! `*_record` functions.

use serde_json::{json, Value};

use crate::ansi::strip_ansi;

// ─── Outgoing records ─────────────────────────────────────────────────────

/// A user prompt, as written to the agent's stdin.
pub fn user_prompt_record(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
    })
}

/// A tool-result reply routed back into the agent's stdin.
pub fn tool_result_record(tool_use_id: &str, answer: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": answer,
            }],
        },
    })
}

/// The synthetic assistant record carrying an `AskUserQuestion` tool_use
/// block, emitted upstream when the MCP adapter hits `/internal/ask-user`.
pub fn ask_user_record(question_id: &str, input: &Value) -> Value {
    json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [{
                "type": "tool_use",
                "id": question_id,
                "name": "AskUserQuestion",
                "input": input,
            }],
        },
    })
}

// ─── Consumed fields ──────────────────────────────────────────────────────

/// The record's `type` discriminant, if present.
pub fn record_type(record: &Value) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}

/// `true` for the terminal `result` record of a query.
pub fn is_result(record: &Value) -> bool {
    record_type(record) == Some("result")
}

/// `total_cost_usd` from a `result` record.
pub fn result_cost_usd(record: &Value) -> Option<f64> {
    record.get("total_cost_usd").and_then(Value::as_f64)
}

/// The final result text from a `result` record (absent on error subtypes).
pub fn result_text(record: &Value) -> Option<&str> {
    record.get("result").and_then(Value::as_str)
}

/// The agent session id, present on most record types.
pub fn session_id(record: &Value) -> Option<&str> {
    record.get("session_id").and_then(Value::as_str)
}

// ─── Line buffering ───────────────────────────────────────────────────────

/// Accumulates raw PTY output and yields one parsed JSON record per
/// complete line.
///
/// ANSI/control runs are stripped per line before parsing; lines that still
/// fail to parse (shell noise, partial writes flushed by the PTY) are
/// dropped. The trailing partial line is kept across chunks.
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    buf: String,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of PTY output; returns the records completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);

        let mut records = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let clean = strip_ansi(&line);
            let trimmed = clean.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => records.push(v),
                Err(_) => continue, // non-JSON noise between records
            }
        }
        records
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
