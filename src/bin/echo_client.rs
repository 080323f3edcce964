//! Minimal client: dials `echo-server` over `PersistentWebsocket::connect` (auto-reconnecting),
//! sends each line of stdin as a message, and prints whatever the server echoes back. Exercises
//! the full client-role API surface end to end.

use clap::Parser;
use futures_util::StreamExt;
use persistent_websocket::{EngineConfig, PersistentWebsocket};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
struct Cli {
    /// Server URL to connect to.
    #[arg(long, default_value = "ws://127.0.0.1:9001/")]
    url: String,

    #[command(flatten)]
    config: EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let engine = PersistentWebsocket::new("echo-client", cli.config);
    let mut messages = engine.connect(cli.url.clone()).await;
    info!("B60460 connecting to {}", cli.url);

    let reader_engine = engine.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            reader_engine.send(line.into_bytes()).await;
        }
    });

    while let Some(item) = messages.next().await {
        match item {
            Ok(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
            Err(e) => {
                error!("B91223 engine unrecoverable: {e}");
                break;
            }
        }
    }
    Ok(())
}
