//! Host proxy listener (spec.md §4.A/J/K/L, component L).
//!
//! Opens a local TCP or UDP listener bound to a forwarded `(task_id, port)`
//! pair. Every inbound connection (or UDP 5-tuple "conversation") mints a
//! fresh `client_id`, sends `CONNECT` into the per-container tunnel session,
//! and splices bytes between the local socket and the tunnel.
//!
//! One `TunnelSession` is shared by every local listener opened for the same
//! container: the outbound WebSocket attachment to the Runner's tunnel
//! server (component J, `GET /tunnel/{container_id}/host`) is dialed once
//! and kept warm, matching the ownership note in spec.md §3 ("Tunnel
//! session... key = container id").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::protocol::{ClientId, Frame, MessageType, Protocol};
use crate::relay::{PING_INTERVAL, PING_TIMEOUT};

const LOCAL_SINK_QUEUE_CAPACITY: usize = 256;
const UDP_CONVERSATION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to dial runner tunnel websocket: {0}")]
    Dial(String),
    #[error("failed to bind local listener: {0}")]
    Bind(std::io::Error),
}

enum LocalSink {
    Tcp(mpsc::Sender<Vec<u8>>),
    Udp { addr: SocketAddr, last_seen: Instant },
}

struct Inner {
    outbound: mpsc::Sender<Frame>,
    next_client_id: AtomicU32,
    local_sinks: Mutex<HashMap<ClientId, LocalSink>>,
    last_traffic: Mutex<Instant>,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
}

/// One live attachment to a container's tunnel, shared by every local
/// forward listener opened against that container.
#[derive(Clone)]
pub struct TunnelSession {
    container_id: String,
    inner: Arc<Inner>,
}

impl TunnelSession {
    /// Dials the Runner's host-attachment endpoint for `container_id` and
    /// starts the reader/writer/keepalive tasks.
    pub async fn connect(runner_ws_base_url: &str, container_id: &str) -> Result<Self, ProxyError> {
        let url = format!(
            "{}/tunnel/{}/host",
            runner_ws_base_url.trim_end_matches('/'),
            container_id
        );
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ProxyError::Dial(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(LOCAL_SINK_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            outbound: outbound_tx,
            next_client_id: AtomicU32::new(1),
            local_sinks: Mutex::new(HashMap::new()),
            last_traffic: Mutex::new(Instant::now()),
            udp_socket: Mutex::new(None),
        });

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_tx.send(WsMessage::Binary(frame.encode())).await.is_err() {
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader_container_id = container_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(WsMessage::Binary(bytes)) => match Frame::decode(&bytes) {
                        Ok(frame) => {
                            *reader_inner.last_traffic.lock().await = Instant::now();
                            dispatch_incoming(&reader_inner, frame).await;
                        }
                        Err(err) => warn!(container_id = %reader_container_id, %err, "malformed tunnel frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(container_id = %reader_container_id, %err, "tunnel transport error");
                        break;
                    }
                }
            }
            close_all_sinks(&reader_inner, "tunnel transport closed").await;
        });

        let keepalive_inner = inner.clone();
        let keepalive_container_id = container_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if keepalive_inner.outbound.send(Frame::ping()).await.is_err() {
                    break;
                }
                let last = *keepalive_inner.last_traffic.lock().await;
                if last.elapsed() > PING_TIMEOUT {
                    warn!(container_id = %keepalive_container_id, "tunnel liveness timeout, tearing down");
                    close_all_sinks(&keepalive_inner, "tunnel liveness timeout").await;
                    break;
                }
            }
        });

        Ok(Self {
            container_id: container_id.to_string(),
            inner,
        })
    }

    /// Opens a local TCP listener that forwards every accepted connection to
    /// `target_port` inside the container.
    pub async fn serve_tcp(&self, listen_addr: SocketAddr, target_port: u16) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(listen_addr).await.map_err(ProxyError::Bind)?;
        info!(container_id = %self.container_id, %listen_addr, target_port, "tcp forward listening");
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "tcp forward accept failed");
                        continue;
                    }
                };
                let session = session.clone();
                tokio::spawn(async move {
                    session.handle_tcp_connection(stream, peer, target_port).await;
                });
            }
        });
        Ok(())
    }

    async fn handle_tcp_connection(&self, stream: TcpStream, peer: SocketAddr, target_port: u16) {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (local_tx, mut local_rx) = mpsc::channel::<Vec<u8>>(LOCAL_SINK_QUEUE_CAPACITY);
        self.inner
            .local_sinks
            .lock()
            .await
            .insert(client_id, LocalSink::Tcp(local_tx));

        if self
            .inner
            .outbound
            .send(Frame::connect(Protocol::Tcp, client_id, target_port))
            .await
            .is_err()
        {
            self.inner.local_sinks.lock().await.remove(&client_id);
            return;
        }

        let (mut read_half, mut write_half) = stream.into_split();
        let inner = self.inner.clone();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(bytes) = local_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let inner_reader = self.inner.clone();
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if inner_reader
                        .outbound
                        .send(Frame::data(Protocol::Tcp, client_id, buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let _ = inner
            .outbound
            .send(Frame::close(Protocol::Tcp, client_id))
            .await;
        inner.local_sinks.lock().await.remove(&client_id);
        writer.abort();
        debug!(%peer, client_id, "tcp forward connection closed");
    }

    /// Opens a local UDP listener; each distinct peer address becomes one
    /// forward-table entry keyed by a minted client_id, aged out after
    /// `UDP_CONVERSATION_IDLE_TIMEOUT` of silence (spec.md §4's UDP note:
    /// "one forward-table entry per (client-addr, port) 5-tuple with idle
    /// timeout", no per-datagram CONNECT/CLOSE).
    pub async fn serve_udp(&self, listen_addr: SocketAddr, target_port: u16) -> Result<(), ProxyError> {
        let socket = Arc::new(UdpSocket::bind(listen_addr).await.map_err(ProxyError::Bind)?);
        info!(container_id = %self.container_id, %listen_addr, target_port, "udp forward listening");
        *self.inner.udp_socket.lock().await = Some(socket.clone());

        let session = self.clone();
        let mut addr_to_client: HashMap<SocketAddr, ClientId> = HashMap::new();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "udp forward recv failed");
                        continue;
                    }
                };
                let client_id = match addr_to_client.get(&peer) {
                    Some(id) => *id,
                    None => {
                        let id = session.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
                        addr_to_client.insert(peer, id);
                        session.inner.local_sinks.lock().await.insert(
                            id,
                            LocalSink::Udp {
                                addr: peer,
                                last_seen: Instant::now(),
                            },
                        );
                        let _ = session
                            .inner
                            .outbound
                            .send(Frame::connect(Protocol::Udp, id, target_port))
                            .await;
                        id
                    }
                };
                if let Some(LocalSink::Udp { last_seen, .. }) =
                    session.inner.local_sinks.lock().await.get_mut(&client_id)
                {
                    *last_seen = Instant::now();
                }
                let _ = session
                    .inner
                    .outbound
                    .send(Frame::data(Protocol::Udp, client_id, buf[..n].to_vec()))
                    .await;
            }
        });

        let reaper = self.clone();
        tokio::spawn(async move {
            reaper.reap_idle_udp_conversations().await;
        });
        Ok(())
    }

    /// Splices a single already-upgraded WebSocket connection as one
    /// tunnel client, for the Host's `GET /forward/{task_id}/{port}`
    /// endpoint (spec.md §6). Unlike `serve_tcp`, there is no local
    /// listener: the caller's WebSocket peer *is* the one client_id.
    pub async fn serve_external(&self, socket: WebSocket, protocol: Protocol, target_port: u16) {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (local_tx, mut local_rx) = mpsc::channel::<Vec<u8>>(LOCAL_SINK_QUEUE_CAPACITY);
        self.inner
            .local_sinks
            .lock()
            .await
            .insert(client_id, LocalSink::Tcp(local_tx));

        if self
            .inner
            .outbound
            .send(Frame::connect(protocol, client_id, target_port))
            .await
            .is_err()
        {
            self.inner.local_sinks.lock().await.remove(&client_id);
            return;
        }

        let (mut ws_tx, mut ws_rx) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = local_rx.recv().await {
                if ws_tx.send(AxumMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(AxumMessage::Binary(bytes)) => {
                    if inner
                        .outbound
                        .send(Frame::data(protocol, client_id, bytes))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(AxumMessage::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        let _ = inner.outbound.send(Frame::close(protocol, client_id)).await;
        inner.local_sinks.lock().await.remove(&client_id);
        writer.abort();
        debug!(client_id, "external forward connection closed");
    }

    async fn reap_idle_udp_conversations(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let mut sinks = self.inner.local_sinks.lock().await;
            let stale: Vec<ClientId> = sinks
                .iter()
                .filter_map(|(id, sink)| match sink {
                    LocalSink::Udp { last_seen, .. }
                        if last_seen.elapsed() > UDP_CONVERSATION_IDLE_TIMEOUT =>
                    {
                        Some(*id)
                    }
                    _ => None,
                })
                .collect();
            for id in stale {
                sinks.remove(&id);
                let _ = self.inner.outbound.send(Frame::close(Protocol::Udp, id)).await;
            }
        }
    }
}

/// Keeps one warm `TunnelSession` per container so repeated forwards to the
/// same container reuse the existing Runner attachment (spec.md §4.A/J/K/L:
/// "opened lazily on first forward and kept warm").
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, TunnelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(
        &self,
        runner_ws_base_url: &str,
        container_id: &str,
    ) -> Result<TunnelSession, ProxyError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(container_id) {
            return Ok(existing.clone());
        }
        let session = TunnelSession::connect(runner_ws_base_url, container_id).await?;
        sessions.insert(container_id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn forget(&self, container_id: &str) {
        self.sessions.lock().await.remove(container_id);
    }
}

async fn dispatch_incoming(inner: &Arc<Inner>, frame: Frame) {
    match frame.message_type {
        MessageType::Pong => {}
        MessageType::Data => {
            let target = {
                let sinks = inner.local_sinks.lock().await;
                match sinks.get(&frame.client_id) {
                    Some(LocalSink::Tcp(tx)) => Some(LocalSink::Tcp(tx.clone())),
                    Some(LocalSink::Udp { addr, .. }) => Some(LocalSink::Udp {
                        addr: *addr,
                        last_seen: Instant::now(),
                    }),
                    None => None,
                }
            };
            match target {
                Some(LocalSink::Tcp(tx)) => {
                    let _ = tx.send(frame.payload).await;
                }
                Some(LocalSink::Udp { addr, .. }) => {
                    if let Some(socket) = inner.udp_socket.lock().await.clone() {
                        let _ = socket.send_to(&frame.payload, addr).await;
                    }
                }
                None => {}
            }
        }
        MessageType::Close | MessageType::Error => {
            inner.local_sinks.lock().await.remove(&frame.client_id);
        }
        MessageType::Connected | MessageType::Connect | MessageType::Ping => {}
    }
}

async fn close_all_sinks(inner: &Arc<Inner>, _reason: &str) {
    inner.local_sinks.lock().await.clear();
}
