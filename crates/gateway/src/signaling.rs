//! Signaling relay for peer-connection negotiation
//!
//! Peers register under an opaque id and exchange `signal` payloads through
//! the gateway. Delivery is best-effort: unknown targets and malformed
//! frames are dropped without a reply.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Frames sent by a peer
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Register {
        #[serde(default)]
        id: Option<String>,
    },
    Signal {
        target: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Frames sent to a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Registered { id: String },
    Signal { from: String, data: serde_json::Value },
}

struct PeerHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// One connected socket and the id it registered under, if any
pub struct PeerSession {
    conn_id: u64,
    id: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl PeerSession {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Peer registry keyed by registered id
#[derive(Default)]
pub struct SignalingRelay {
    peers: DashMap<String, PeerHandle>,
    next_conn: AtomicU64,
}

fn generate_peer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Start tracking a connection whose outbound frames go to `tx`
    pub fn open_session(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> PeerSession {
        PeerSession {
            conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            id: None,
            tx,
        }
    }

    /// Handle one inbound text frame
    pub fn handle_frame(&self, session: &mut PeerSession, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("Ignoring malformed signaling frame: {}", e);
                return;
            }
        };

        match msg {
            ClientMessage::Register { id } => self.register(session, id),
            ClientMessage::Signal { target, data } => {
                let Some(from) = session.id.clone() else {
                    debug!("Dropping signal from unregistered peer");
                    return;
                };
                match self.peers.get(&target) {
                    Some(peer) => {
                        let _ = peer.tx.send(ServerMessage::Signal { from, data });
                    }
                    None => debug!("Dropping signal for unknown peer {}", target),
                }
            }
        }
    }

    fn register(&self, session: &mut PeerSession, requested: Option<String>) {
        let id = requested
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_peer_id);

        if let Some(previous) = session.id.take() {
            if previous != id {
                self.peers
                    .remove_if(&previous, |_, peer| peer.conn_id == session.conn_id);
            }
        }

        let replaced = self.peers.insert(
            id.clone(),
            PeerHandle {
                conn_id: session.conn_id,
                tx: session.tx.clone(),
            },
        );
        if replaced.is_some_and(|old| old.conn_id != session.conn_id) {
            debug!("Peer id {} taken over by a new connection", id);
        }

        session.id = Some(id.clone());
        debug!("Peer registered: {}", id);
        let _ = session.tx.send(ServerMessage::Registered { id });
    }

    /// Drop the session's registration if it still owns it
    pub fn close_session(&self, session: PeerSession) {
        if let Some(id) = session.id {
            if self
                .peers
                .remove_if(&id, |_, peer| peer.conn_id == session.conn_id)
                .is_some()
            {
                debug!("Peer unregistered: {}", id);
            }
        }
    }

    /// Serve one upgraded `/signal` socket until it closes
    pub async fn serve(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        let mut session = self.open_session(tx);
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_frame(&mut session, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Signaling socket error: {}", e);
                    break;
                }
            }
        }

        self.close_session(session);
        writer.abort();
    }
}
