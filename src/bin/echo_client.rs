//! Echo client
//!
//! Connects to a WebSocket server, sends every stdin line as a text message
//! and logs what comes back. EOF or Ctrl+C closes the session normally.
//!
//! Usage: `echo_client [ws://host:port/path]` (default `$WSENGINE_URL`, then
//! `ws://127.0.0.1:9001`).

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use wsengine_demo::bin_common::{
    init_tracing, load_client_config, parse_args, BinaryRunner, ConfigType, RunConfig,
};
use wsengine_demo::wsengine::{
    CloseCode, CloseStatus, Endpoint, Session, WebSocketClient,
};

const DEFAULT_URL: &str = "ws://127.0.0.1:9001";

struct EchoClient {
    run_config: RunConfig,
    url: String,
    client: WebSocketClient,
    session: Option<Session>,
}

impl EchoClient {
    fn new(url: String, client: WebSocketClient) -> Self {
        Self {
            run_config: RunConfig::new("echo_client").with_heartbeat(30),
            url,
            client,
            session: None,
        }
    }
}

impl BinaryRunner for EchoClient {
    async fn run(&mut self) -> Result<()> {
        self.client.start()?;

        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<CloseStatus>();
        let endpoint = Endpoint::builder()
            .on_open(|session| {
                info!("Session {} open", session.id());
                Ok(())
            })
            .on_text::<String, _>(|_, text| {
                info!("< {}", text);
                Ok(())
            })
            .on_binary::<Vec<u8>, _>(|_, data| {
                info!("< {} bytes", data.len());
                Ok(())
            })
            .on_error(|session, error| warn!("Session {} error: {}", session.id(), error))
            .on_close(move |_, status| {
                let _ = close_tx.send(status.clone());
            })
            .build()?;

        let session = self
            .client
            .connect(&self.url, endpoint)
            .await
            .with_context(|| format!("connecting to {}", self.url))?;
        self.session = Some(session.clone());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut heartbeat = tokio::time::interval(self.run_config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if let Err(e) = session.send_text(line) {
                                warn!("Send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                status = close_rx.recv() => {
                    if let Some(status) = status {
                        info!("Server closed the session: {}", status);
                    }
                    self.client.stop();
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let metrics = session.metrics();
                    info!(
                        "Heartbeat: {} frames in, {} frames out, idle {:?}",
                        metrics.frames_received,
                        metrics.frames_sent,
                        session.idle_time()
                    );
                    if session.is_pong_pending() {
                        warn!("Previous ping is still unanswered");
                    }
                    if let Err(e) = session.send_ping(b"heartbeat".to_vec()) {
                        warn!("Ping failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received");
                    break;
                }
            }
        }

        session.close(CloseCode::Normal, "bye")?;
        let timeout = session.config().close_timeout + Duration::from_secs(1);
        match tokio::time::timeout(timeout, close_rx.recv()).await {
            Ok(Some(status)) => info!("Closed: {}", status),
            _ => warn!("Close handshake did not complete"),
        }

        self.client.stop();
        Ok(())
    }

    fn config(&self) -> &RunConfig {
        &self.run_config
    }

    fn stats(&self) -> Option<String> {
        self.session.as_ref().map(|session| {
            let metrics = session.metrics();
            format!(
                "Messages received: {}, frames sent: {}",
                metrics.messages_received, metrics.frames_sent
            )
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let url = parse_args()
        .into_iter()
        .next()
        .or_else(|| std::env::var("WSENGINE_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    let config = load_client_config(ConfigType::Client)?;
    let client = WebSocketClient::builder().config(config).build()?;

    EchoClient::new(url, client).execute().await
}
