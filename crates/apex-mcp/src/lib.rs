//! Stdio JSON-RPC 2.0 server the agent CLI spawns inside the sandbox.
//!
//! Pure translation: each `tools/call` becomes one HTTP request on the
//! bridge's loopback internal routes, and the response's string payload is
//! wrapped in an MCP text content block. No state is retained between
//! calls; the bridge owns every terminal.

use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "apex-terminal";

// ---------------------------------------------------------------------------
// Bridge HTTP client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BridgeHttp {
    base_url: String,
    http: reqwest::Client,
}

impl BridgeHttp {
    pub fn new(port: u16) -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{port}"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, String> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("bridge unreachable: {e}"))?;
        Self::read_json(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, String> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| format!("bridge unreachable: {e}"))?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, String> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("bad bridge response: {e}"))?;
        if status.is_success() {
            Ok(body)
        } else {
            let message = body["error"].as_str().unwrap_or("bridge error").to_string();
            Err(message)
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "open_terminal",
            "description": "Open a new terminal in the sandbox. Optionally run a command in it.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Display name for the terminal tab" },
                    "command": { "type": "string", "description": "Command to run (defaults to an interactive shell)" },
                    "cwd": { "type": "string", "description": "Working directory" }
                }
            }
        },
        {
            "name": "write_to_terminal",
            "description": "Write input to a terminal (include \\n to run a command).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "terminalId": { "type": "string" },
                    "data": { "type": "string" }
                },
                "required": ["terminalId", "data"]
            }
        },
        {
            "name": "read_terminal",
            "description": "Read recent output from a terminal.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "terminalId": { "type": "string" },
                    "lines": { "type": "number", "description": "How many recent chunks to return (all when omitted)" }
                },
                "required": ["terminalId"]
            }
        },
        {
            "name": "list_terminals",
            "description": "List the open terminals.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "close_terminal",
            "description": "Close a terminal.",
            "inputSchema": {
                "type": "object",
                "properties": { "terminalId": { "type": "string" } },
                "required": ["terminalId"]
            }
        },
        {
            "name": "get_preview_url",
            "description": "Get the public preview URL for a port served inside the sandbox. Always share this URL instead of localhost.",
            "inputSchema": {
                "type": "object",
                "properties": { "port": { "type": "number" } },
                "required": ["port"]
            }
        }
    ])
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

fn rpc_result(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn rpc_error(id: &Value, code: i64, message: &str) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
        .to_string()
}

fn text_result(id: &Value, text: String) -> String {
    rpc_result(id, json!({ "content": [{ "type": "text", "text": text }] }))
}

fn error_result(id: &Value, text: String) -> String {
    rpc_result(
        id,
        json!({ "content": [{ "type": "text", "text": text }], "isError": true }),
    )
}

/// Handle one JSON-RPC line. `None` means no response (notifications and
/// unparseable input).
pub async fn handle_line(line: &str, bridge: &BridgeHttp) -> Option<String> {
    let request: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!("dropping unparseable request line: {err}");
            return None;
        }
    };
    let method = request["method"].as_str()?;
    if method.starts_with("notifications/") {
        return None;
    }
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match method {
        "initialize" => Some(rpc_result(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            }),
        )),
        "tools/list" => Some(rpc_result(&id, json!({ "tools": tool_definitions() }))),
        "tools/call" => {
            let name = request["params"]["name"].as_str().unwrap_or("");
            let args = request["params"]["arguments"].clone();
            Some(match call_tool(bridge, name, args).await {
                Ok(text) => text_result(&id, text),
                Err(message) => error_result(&id, message),
            })
        }
        _ => Some(rpc_error(&id, -32601, "method not found")),
    }
}

async fn call_tool(bridge: &BridgeHttp, name: &str, args: Value) -> Result<String, String> {
    match name {
        "open_terminal" => {
            let body = bridge
                .post(
                    "/internal/terminal-create",
                    json!({
                        "name": args["name"],
                        "command": args["command"],
                        "cwd": args["cwd"],
                    }),
                )
                .await?;
            Ok(body["terminalId"].as_str().unwrap_or_default().to_string())
        }
        "write_to_terminal" => {
            bridge
                .post(
                    "/internal/terminal-write",
                    json!({ "terminalId": args["terminalId"], "data": args["data"] }),
                )
                .await?;
            Ok("ok".to_string())
        }
        "read_terminal" => {
            let body = bridge
                .post(
                    "/internal/terminal-read",
                    json!({ "terminalId": args["terminalId"], "lines": args["lines"] }),
                )
                .await?;
            Ok(body["output"].as_str().unwrap_or_default().to_string())
        }
        "list_terminals" => {
            let body = bridge.get("/internal/terminal-list").await?;
            Ok(body["terminals"].to_string())
        }
        "close_terminal" => {
            bridge
                .post(
                    "/internal/terminal-close",
                    json!({ "terminalId": args["terminalId"] }),
                )
                .await?;
            Ok("ok".to_string())
        }
        "get_preview_url" => {
            let body = bridge
                .post("/internal/preview-url", json!({ "port": args["port"] }))
                .await?;
            Ok(body.to_string())
        }
        other => Err(format!("unknown tool: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(response: Option<String>) -> Value {
        serde_json::from_str(&response.expect("expected a response")).unwrap()
    }

    #[tokio::test]
    async fn initialize_reports_tools_capability() {
        let bridge = BridgeHttp::with_base_url("http://127.0.0.1:1");
        let response = parse(
            handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
                &bridge,
            )
            .await,
        );
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn initialized_notification_gets_no_response() {
        let bridge = BridgeHttp::with_base_url("http://127.0.0.1:1");
        let response = handle_line(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            &bridge,
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_names_the_fixed_tool_set() {
        let bridge = BridgeHttp::with_base_url("http://127.0.0.1:1");
        let response = parse(
            handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#, &bridge).await,
        );
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "open_terminal",
                "write_to_terminal",
                "read_terminal",
                "list_terminals",
                "close_terminal",
                "get_preview_url",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_method_is_a_jsonrpc_error() {
        let bridge = BridgeHttp::with_base_url("http://127.0.0.1:1");
        let response = parse(
            handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#, &bridge).await,
        );
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn open_terminal_translates_to_terminal_create() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/internal/terminal-create")
            .match_body(mockito::Matcher::PartialJson(json!({ "name": "dev" })))
            .with_body(r#"{"terminalId":"mcp-00c0ffee"}"#)
            .create_async()
            .await;

        let bridge = BridgeHttp::with_base_url(server.url());
        let request = json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "open_terminal", "arguments": { "name": "dev" } },
        });
        let response = parse(handle_line(&request.to_string(), &bridge).await);
        assert_eq!(response["result"]["content"][0]["type"], "text");
        assert_eq!(response["result"]["content"][0]["text"], "mcp-00c0ffee");
        assert!(response["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn read_terminal_returns_the_output_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/internal/terminal-read")
            .with_body(r#"{"output":"$ npm run dev\nready on :3000\n"}"#)
            .create_async()
            .await;

        let bridge = BridgeHttp::with_base_url(server.url());
        let request = json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": { "name": "read_terminal",
                        "arguments": { "terminalId": "mcp-1", "lines": 50 } },
        });
        let response = parse(handle_line(&request.to_string(), &bridge).await);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("ready on :3000"));
    }

    #[tokio::test]
    async fn bridge_errors_become_is_error_results() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/internal/terminal-write")
            .with_status(404)
            .with_body(r#"{"error":"no terminal with id ghost"}"#)
            .create_async()
            .await;

        let bridge = BridgeHttp::with_base_url(server.url());
        let request = json!({
            "jsonrpc": "2.0", "id": 6, "method": "tools/call",
            "params": { "name": "write_to_terminal",
                        "arguments": { "terminalId": "ghost", "data": "ls\n" } },
        });
        let response = parse(handle_line(&request.to_string(), &bridge).await);
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("ghost"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_is_error_result() {
        let bridge = BridgeHttp::with_base_url("http://127.0.0.1:1");
        let request = json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": { "name": "launch_rocket", "arguments": {} },
        });
        let response = parse(handle_line(&request.to_string(), &bridge).await);
        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn get_preview_url_passes_url_and_token_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/internal/preview-url")
            .match_body(mockito::Matcher::PartialJson(json!({ "port": 3000 })))
            .with_body(r#"{"url":"https://3000-sb.proxy.example.dev","token":"t"}"#)
            .create_async()
            .await;

        let bridge = BridgeHttp::with_base_url(server.url());
        let request = json!({
            "jsonrpc": "2.0", "id": 8, "method": "tools/call",
            "params": { "name": "get_preview_url", "arguments": { "port": 3000 } },
        });
        let response = parse(handle_line(&request.to_string(), &bridge).await);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("https://3000-sb.proxy.example.dev"));
    }
}
