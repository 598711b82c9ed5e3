//! IDE layout persistence: one opaque JSON document per sandbox at
//! `~/.apex-layout.json`. The manager never interprets its contents.

use serde_json::Value;

use crate::error::{ManagerError, Result};
use crate::platform::PlatformClient;

pub const LAYOUT_PATH: &str = "/home/daytona/.apex-layout.json";

pub async fn save_layout(
    platform: &PlatformClient,
    sandbox_id: &str,
    layout: &Value,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(layout)?;
    platform.upload_file(sandbox_id, LAYOUT_PATH, bytes).await
}

/// Load the stored layout; `None` when no layout was ever saved.
pub async fn load_layout(platform: &PlatformClient, sandbox_id: &str) -> Result<Option<Value>> {
    match platform.download_file(sandbox_id, LAYOUT_PATH).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(ManagerError::Platform(msg)) if msg.contains("404") => Ok(None),
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
