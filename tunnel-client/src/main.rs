//! In-container tunnel client (spec.md §4.A/J/K/L, component K).
//!
//! Reads its Runner URL and container id from the environment (or flags,
//! for local testing), dials `WS /tunnel/{container_id}`, and for every
//! `CONNECT` it receives dials `127.0.0.1:port` and splices `DATA`/`CLOSE`
//! frames to/from that socket, keyed by `client_id`. Sends periodic `PING`
//! and reconnects with jittered backoff on any transport error, discarding
//! in-flight client_id mappings (the Host proxy observes the reset).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use kohakuriver_tunnel::{ClientId, Frame, MessageType, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

#[derive(Parser, Debug)]
#[command(name = "tunnel-client")]
struct Args {
    /// Runner WebSocket base URL. Falls back to KOHAKURIVER_TUNNEL_URL.
    #[arg(long, env = "KOHAKURIVER_TUNNEL_URL")]
    runner_url: String,

    /// Container id to register under. Falls back to KOHAKURIVER_CONTAINER_ID.
    #[arg(long, env = "KOHAKURIVER_CONTAINER_ID")]
    container_id: String,

    #[arg(long, default_value = "info")]
    log_level: String,
}

enum LocalSink {
    Tcp(mpsc::Sender<Vec<u8>>),
    Udp(Arc<UdpSocket>),
}

struct Forwards {
    sinks: Mutex<HashMap<ClientId, LocalSink>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut attempt: u32 = 0;
    loop {
        match run_once(&args).await {
            Ok(()) => attempt = 0,
            Err(err) => warn!(%err, "tunnel connection ended"),
        }
        let backoff = jittered_backoff(attempt);
        debug!(?backoff, "reconnecting after backoff");
        tokio::time::sleep(backoff).await;
        attempt = attempt.saturating_add(1);
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32.checked_shl(attempt.min(5)).unwrap_or(u32::MAX));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_ms = rand::random::<u64>() % 250;
    capped + Duration::from_millis(jitter_ms)
}

async fn run_once(args: &Args) -> Result<(), String> {
    let url = format!(
        "{}/tunnel/{}",
        args.runner_url.trim_end_matches('/'),
        args.container_id
    );
    info!(%url, "connecting to runner tunnel");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| e.to_string())?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
    let forwards = Arc::new(Forwards {
        sinks: Mutex::new(HashMap::new()),
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(WsMessage::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
    });

    let ping_tx = outbound_tx.clone();
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        loop {
            ticker.tick().await;
            if ping_tx.send(Frame::ping()).await.is_err() {
                break;
            }
        }
    });

    let next_tag = Arc::new(AtomicU64::new(0));
    let result = loop {
        match ws_rx.next().await {
            Some(Ok(WsMessage::Binary(bytes))) => match Frame::decode(&bytes) {
                Ok(frame) => {
                    handle_frame(frame, &forwards, &outbound_tx, &next_tag).await;
                }
                Err(err) => warn!(%err, "malformed frame from runner"),
            },
            Some(Ok(WsMessage::Close(_))) => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(err.to_string()),
            None => break Ok(()),
        }
    };

    writer.abort();
    keepalive.abort();
    forwards.sinks.lock().await.clear();
    result
}

async fn handle_frame(
    frame: Frame,
    forwards: &Arc<Forwards>,
    outbound: &mpsc::Sender<Frame>,
    next_tag: &Arc<AtomicU64>,
) {
    match frame.message_type {
        MessageType::Connect => {
            spawn_local_dial(frame.protocol, frame.client_id, frame.port, forwards.clone(), outbound.clone())
                .await;
        }
        MessageType::Data => {
            let sink = forwards.sinks.lock().await;
            match sink.get(&frame.client_id) {
                Some(LocalSink::Tcp(tx)) => {
                    let _ = tx.send(frame.payload).await;
                }
                Some(LocalSink::Udp(socket)) => {
                    let tag = next_tag.fetch_add(1, Ordering::Relaxed);
                    debug!(tag, "udp datagram to local service");
                    let _ = socket.send(&frame.payload).await;
                }
                None => {
                    let _ = outbound
                        .send(Frame::error(frame.protocol, frame.client_id, "unknown client_id"))
                        .await;
                }
            }
        }
        MessageType::Close => {
            forwards.sinks.lock().await.remove(&frame.client_id);
        }
        MessageType::Pong => {}
        MessageType::Ping | MessageType::Connected | MessageType::Error => {}
    }
}

async fn spawn_local_dial(
    protocol: Protocol,
    client_id: ClientId,
    port: u16,
    forwards: Arc<Forwards>,
    outbound: mpsc::Sender<Frame>,
) {
    match protocol {
        Protocol::Tcp => {
            let stream = match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(port, %err, "failed to dial local tcp service");
                    let _ = outbound
                        .send(Frame::error(protocol, client_id, format!("connect failed: {err}")))
                        .await;
                    return;
                }
            };
            let (local_tx, mut local_rx) = mpsc::channel::<Vec<u8>>(256);
            forwards.sinks.lock().await.insert(client_id, LocalSink::Tcp(local_tx));
            let _ = outbound.send(Frame::connected(protocol, client_id)).await;

            let (mut read_half, mut write_half) = stream.into_split();
            let writer = tokio::spawn(async move {
                while let Some(bytes) = local_rx.recv().await {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });

            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if outbound
                            .send(Frame::data(protocol, client_id, buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = outbound.send(Frame::close(protocol, client_id)).await;
            forwards.sinks.lock().await.remove(&client_id);
            writer.abort();
        }
        Protocol::Udp => {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(err) => {
                    warn!(%err, "failed to bind local udp socket");
                    return;
                }
            };
            if socket.connect(("127.0.0.1", port)).await.is_err() {
                return;
            }
            let socket = Arc::new(socket);
            forwards
                .sinks
                .lock()
                .await
                .insert(client_id, LocalSink::Udp(socket.clone()));
            let _ = outbound.send(Frame::connected(protocol, client_id)).await;

            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(n) => {
                            if outbound
                                .send(Frame::data(Protocol::Udp, client_id, buf[..n].to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }
}
