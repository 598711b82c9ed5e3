use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use apex_bridge::state::{BridgeConfig, BridgeState};

#[derive(Parser, Debug)]
#[command(name = "apex-bridge", version)]
struct Options {
    /// Port for the HTTP + WebSocket listener
    #[arg(long, default_value_t = 8080, env = "APEX_BRIDGE_PORT")]
    port: u16,
    /// The agent's working directory (the cloned project)
    #[arg(long, env = "APEX_PROJECT_DIR")]
    project_dir: PathBuf,
    /// Sandbox id, used for preview-URL lookups
    #[arg(long, default_value = "", env = "DAYTONA_SANDBOX_ID")]
    sandbox_id: String,
    /// Platform API base URL
    #[arg(long, default_value = "", env = "DAYTONA_API_URL")]
    api_url: String,
    /// Platform API bearer token
    #[arg(long, default_value = "", env = "DAYTONA_API_KEY", hide_env_values = true)]
    api_key: String,
    /// Ports the scanner never reports (code-server, sshd); the bridge's own
    /// port is always skipped
    #[arg(long = "skip-port", default_values_t = [9090u16, 22])]
    skip_ports: Vec<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = Options::parse();
    let state = BridgeState::new(BridgeConfig {
        port: options.port,
        project_dir: options.project_dir,
        sandbox_id: options.sandbox_id,
        api_url: options.api_url,
        api_key: options.api_key,
        skip_ports: options.skip_ports,
    });

    apex_bridge::serve(state).await
}
