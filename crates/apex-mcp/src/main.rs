use clap::Parser;
use tokio::io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use apex_mcp::{handle_line, BridgeHttp};

#[derive(Parser, Debug)]
#[command(name = "apex-mcp", version)]
struct Options {
    /// Port of the bridge's loopback HTTP surface
    #[arg(long, default_value_t = 8080, env = "APEX_BRIDGE_PORT")]
    bridge_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON-RPC stream; logs must go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = Options::parse();
    let bridge = BridgeHttp::new(options.bridge_port);

    let mut lines = BufReader::new(stdin()).lines();
    let mut out = stdout();
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = handle_line(&line, &bridge).await {
            out.write_all(response.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
    }
    Ok(())
}
