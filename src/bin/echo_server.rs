//! Minimal server: accepts one TCP connection per run, performs the WebSocket handshake itself
//! (no HTTP routing layer — that is explicitly out of scope, spec.md §1), then hands the socket
//! to `PersistentWebsocket::connected` and echoes every message it yields back on the same
//! channel. Useful for manual smoke-testing and as executable documentation of the API surface.

use clap::Parser;
use fastwebsockets::upgrade;
use futures_util::StreamExt;
use http_body_util::Empty;
use hyper::body::{Bytes as HyperBytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use persistent_websocket::{EngineConfig, FastWsTransport, PersistentWebsocket};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9001")]
    listen: String,

    #[command(flatten)]
    config: EngineConfig,
}

async fn handle(
    mut req: Request<Incoming>,
    log_id: String,
    config: EngineConfig,
) -> Result<Response<Empty<HyperBytes>>, hyper::Error> {
    let (response, fut) = upgrade::upgrade(&mut req).expect("request is a websocket upgrade");
    tokio::spawn(async move {
        let ws = match fut.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("B60450 {log_id} handshake failed: {e}");
                return;
            }
        };
        let engine = PersistentWebsocket::new(log_id.clone(), config);
        let mut messages = engine.connected(Box::new(FastWsTransport::from_upgraded(ws))).await;
        while let Some(item) = messages.next().await {
            match item {
                Ok(bytes) => {
                    info!("B60451 {log_id} echoing {} bytes", bytes.len());
                    engine.send(bytes).await;
                }
                Err(e) => {
                    warn!("B91222 {log_id} engine unrecoverable: {e}");
                    break;
                }
            }
        }
    });
    Ok(response.map(|_: Empty<HyperBytes>| Empty::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let listener = TcpListener::bind(&cli.listen).await?;
    info!("B60452 listening on {}", cli.listen);

    loop {
        let (stream, peer) = listener.accept().await?;
        let log_id = format!("server:{peer}");
        let config = cli.config.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(req, log_id.clone(), config.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
                warn!("B60453 connection error: {e}");
            }
        });
    }
}
