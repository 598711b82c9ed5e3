//! REST client for the cloud-sandbox platform.
//!
//! The platform itself is an external collaborator; this module pins down
//! the slice of its API the orchestrator depends on: sandbox lifecycle,
//! preview URLs, command execution, file transfer, and detached exec
//! sessions (used to keep the bridge running after the API call returns).

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    /// Platform lifecycle state, e.g. `"started"` / `"stopped"`.
    pub state: String,
}

impl SandboxInfo {
    pub fn is_started(&self) -> bool {
        self.state == "started"
    }
}

/// A signed preview URL plus the token required on WebSocket upgrades.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAccess {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ManagerError::Platform(format!("HTTP {status}: {body}")))
    }

    // ── Sandbox lifecycle ────────────────────────────────────────────────

    pub async fn create(&self, snapshot: &str) -> Result<SandboxInfo> {
        let response = self
            .http
            .post(self.url("/sandbox"))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "snapshot": snapshot }))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .http
            .get(self.url(&format!("/sandbox/{sandbox_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn start(&self, sandbox_id: &str, timeout_secs: u64) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/sandbox/{sandbox_id}/start")))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "timeout": timeout_secs }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/sandbox/{sandbox_id}/stop")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/sandbox/{sandbox_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    /// Copy-on-write fork; returns the new sandbox.
    pub async fn fork(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .http
            .post(self.url(&format!("/sandbox/{sandbox_id}/fork")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn preview_url(&self, sandbox_id: &str, port: u16) -> Result<PreviewInfo> {
        let response = self
            .http
            .get(self.url(&format!("/sandbox/{sandbox_id}/ports/{port}/preview-url")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn ssh_access(&self, sandbox_id: &str) -> Result<SshAccess> {
        let response = self
            .http
            .post(self.url(&format!("/sandbox/{sandbox_id}/ssh-access")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    // ── Command execution ────────────────────────────────────────────────

    /// Run a shell command inside the sandbox and wait for it.
    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecResult> {
        let mut body = serde_json::json!({ "command": command });
        if let Some(cwd) = cwd {
            body["cwd"] = serde_json::Value::String(cwd.to_string());
        }
        if let Some(timeout) = timeout_secs {
            body["timeout"] = serde_json::Value::from(timeout);
        }
        let response = self
            .http
            .post(self.url(&format!("/toolbox/{sandbox_id}/process/execute")))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// Like [`exec`](Self::exec), but failing exit codes become errors.
    pub async fn exec_checked(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<String> {
        let result = self.exec(sandbox_id, command, cwd, timeout_secs).await?;
        if result.exit_code != 0 {
            return Err(ManagerError::CommandFailed {
                code: result.exit_code,
                output: result.result,
            });
        }
        Ok(result.result)
    }

    // ── Detached exec sessions ───────────────────────────────────────────

    pub async fn create_exec_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/toolbox/{sandbox_id}/process/session")))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "sessionId": session_id }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn delete_exec_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!(
                "/toolbox/{sandbox_id}/process/session/{session_id}"
            )))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    /// Fire-and-forget a command inside a named session; the process
    /// outlives this API call.
    pub async fn session_exec_detached(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/toolbox/{sandbox_id}/process/session/{session_id}/exec"
            )))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "command": command, "runAsync": true }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    // ── File transfer ────────────────────────────────────────────────────

    pub async fn upload_file(&self, sandbox_id: &str, dest: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/toolbox/{sandbox_id}/files/upload")))
            .bearer_auth(&self.api_key)
            .query(&[("path", dest)])
            .body(bytes)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/toolbox/{sandbox_id}/files/download")))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .send()
            .await?;
        Ok(self.check(response).await?.bytes().await?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
