//! Runner tunnel server (spec.md §4.A/J/K/L, component J).
//!
//! Relays frames between exactly two peers per container: the in-container
//! tunnel client (K), which registers at `WS /tunnel/{container_id}`, and
//! the Host's proxy (L), which attaches at `GET /tunnel/{container_id}/host`
//! (SPEC_FULL.md's resolution of how L reaches a container's tunnel).
//! `CONNECT` always originates from the Host side; everything else flows
//! both ways, keyed by `client_id`.
//!
//! Flow control: each peer link writes through one bounded channel, so a
//! slow peer naturally backpressures whoever is routing frames to it
//! (spec.md §4's "bounded queue plus reader pause" contract). Per-client_id
//! write fairness beyond that shared queue is the explicit Open Question
//! spec.md §9 leaves unconfirmed under high concurrency; this relay does
//! not attempt a bespoke per-client scheduler on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::protocol::{ClientId, Frame, MessageType, Protocol};

/// Capacity of each peer's outbound queue (spec.md's "bounded in-flight queue").
const PEER_QUEUE_CAPACITY: usize = 256;

/// Tunnel is considered dead after 2x the ping interval without traffic
/// (spec.md §5 timeouts).
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Container,
    Host,
}

struct PeerLink {
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl PeerLink {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            outbound: Mutex::new(None),
        }
    }

    async fn send(&self, frame: Frame) -> bool {
        let sender = self.outbound.lock().await.clone();
        match sender {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}

/// Per-container tunnel state: one record per live (or recently live) container.
pub struct Session {
    container_id: String,
    container_link: PeerLink,
    host_link: PeerLink,
    active_clients: Mutex<HashSet<ClientId>>,
}

impl Session {
    fn new(container_id: String) -> Self {
        Self {
            container_id,
            container_link: PeerLink::new(),
            host_link: PeerLink::new(),
            active_clients: Mutex::new(HashSet::new()),
        }
    }

    fn link(&self, side: Side) -> &PeerLink {
        match side {
            Side::Container => &self.container_link,
            Side::Host => &self.host_link,
        }
    }

    fn other(side: Side) -> Side {
        match side {
            Side::Container => Side::Host,
            Side::Host => Side::Container,
        }
    }

    async fn route(&self, from: Side, frame: Frame) {
        match frame.message_type {
            MessageType::Ping => {
                // Liveness is answered directly on the same leg, never relayed.
                let _ = self.link(from).send(Frame::pong()).await;
            }
            MessageType::Pong => {}
            MessageType::Connect => {
                self.active_clients.lock().await.insert(frame.client_id);
                if !self.link(Self::other(from)).send(frame.clone()).await {
                    self.link(from)
                        .send(Frame::error(
                            frame.protocol,
                            frame.client_id,
                            "no peer attached to forward CONNECT",
                        ))
                        .await;
                }
            }
            MessageType::Data => {
                let known = self.active_clients.lock().await.contains(&frame.client_id);
                if !known {
                    self.link(from)
                        .send(Frame::error(
                            frame.protocol,
                            frame.client_id,
                            "unknown client_id",
                        ))
                        .await;
                    return;
                }
                if !self.link(Self::other(from)).send(frame.clone()).await {
                    self.link(from)
                        .send(Frame::error(
                            frame.protocol,
                            frame.client_id,
                            "peer not attached",
                        ))
                        .await;
                }
            }
            MessageType::Close => {
                self.active_clients.lock().await.remove(&frame.client_id);
                self.link(Self::other(from)).send(frame).await;
            }
            MessageType::Connected | MessageType::Error => {
                self.link(Self::other(from)).send(frame).await;
            }
        }
    }
}

/// Registry of all live tunnel sessions, indexed by container id.
#[derive(Clone)]
pub struct Relay {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn session_for(&self, container_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Session::new(container_id.to_string())))
            .clone()
    }

    /// Handles the in-container client's registration connection.
    pub async fn handle_container_socket(&self, container_id: String, socket: WebSocket) {
        let session = self.session_for(&container_id).await;
        attach(session, Side::Container, socket).await;
    }

    /// Handles the Host proxy's attachment connection for one container.
    pub async fn handle_host_socket(&self, container_id: String, socket: WebSocket) {
        let session = self.session_for(&container_id).await;
        attach(session, Side::Host, socket).await;
    }

    /// Drops bookkeeping for a container whose task has reached a terminal
    /// state, so a stale entry doesn't linger after the container is gone.
    pub async fn forget(&self, container_id: &str) {
        self.sessions.lock().await.remove(container_id);
    }
}

async fn attach(session: Arc<Session>, side: Side, socket: WebSocket) {
    let generation = session.link(side).generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(PEER_QUEUE_CAPACITY);
    *session.link(side).outbound.lock().await = Some(outbound_tx);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(message) = ws_rx.next().await {
        // A newer connection on the same side evicted us; stop draining.
        if session.link(side).generation.load(Ordering::SeqCst) != generation {
            debug!(container_id = %session.container_id, side = side_debug(side), "evicted by newer connection");
            break;
        }
        match message {
            Ok(Message::Binary(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => session.route(side, frame).await,
                Err(err) => warn!(container_id = %session.container_id, %err, "dropping malformed frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(container_id = %session.container_id, %err, "tunnel transport error");
                break;
            }
        }
    }

    // Only clear the link if we are still the current generation (an evictor
    // already replaced it otherwise).
    if session.link(side).generation.load(Ordering::SeqCst) == generation {
        *session.link(side).outbound.lock().await = None;
    }
    writer.abort();
}

fn side_debug(side: Side) -> &'static str {
    match side {
        Side::Container => "container",
        Side::Host => "host",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_client_id_on_data_gets_error_back() {
        let session = Arc::new(Session::new("c1".into()));
        let (tx, mut rx) = mpsc::channel(8);
        *session.container_link.outbound.lock().await = Some(tx);

        session
            .route(Side::Container, Frame::data(Protocol::Tcp, 99, vec![1]))
            .await;

        let reply = rx.recv().await.expect("expected an ERROR frame echoed back");
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.client_id, 99);
    }

    #[tokio::test]
    async fn connect_then_data_routes_to_the_other_side() {
        let session = Arc::new(Session::new("c1".into()));
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let (container_tx, mut container_rx) = mpsc::channel(8);
        *session.host_link.outbound.lock().await = Some(host_tx);
        *session.container_link.outbound.lock().await = Some(container_tx);

        session
            .route(Side::Host, Frame::connect(Protocol::Tcp, 1, 8080))
            .await;
        let forwarded = container_rx.recv().await.unwrap();
        assert_eq!(forwarded.message_type, MessageType::Connect);

        session
            .route(Side::Container, Frame::data(Protocol::Tcp, 1, b"pong".to_vec()))
            .await;
        let forwarded = host_rx.recv().await.unwrap();
        assert_eq!(forwarded.payload, b"pong");
    }

    #[tokio::test]
    async fn ping_is_answered_on_the_same_leg_not_relayed() {
        let session = Arc::new(Session::new("c1".into()));
        let (tx, mut rx) = mpsc::channel(8);
        let (other_tx, mut other_rx) = mpsc::channel(8);
        *session.container_link.outbound.lock().await = Some(tx);
        *session.host_link.outbound.lock().await = Some(other_tx);

        session.route(Side::Container, Frame::ping()).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Pong);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_clears_active_client_so_later_data_errors() {
        let session = Arc::new(Session::new("c1".into()));
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let (container_tx, mut container_rx) = mpsc::channel(8);
        *session.host_link.outbound.lock().await = Some(host_tx);
        *session.container_link.outbound.lock().await = Some(container_tx);

        session.route(Side::Host, Frame::connect(Protocol::Tcp, 5, 22)).await;
        container_rx.recv().await.unwrap();

        session.route(Side::Host, Frame::close(Protocol::Tcp, 5)).await;
        container_rx.recv().await.unwrap();

        session.route(Side::Container, Frame::data(Protocol::Tcp, 5, vec![9])).await;
        let reply = host_rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
    }
}
