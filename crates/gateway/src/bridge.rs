//! VNC WebSocket bridge
//!
//! Bridges an upgraded browser WebSocket to an instance's VNC server over
//! TCP. Bytes are relayed verbatim in both directions; nothing here looks
//! at the RFB protocol.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use loco_common::{Error, Result};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Port used when a target does not carry a usable one.
pub const DEFAULT_VNC_PORT: u16 = 5901;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Resolved upstream address of a VNC server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTarget {
    pub host: String,
    pub port: u16,
}

impl BridgeTarget {
    /// Parse `host:port` or a URL-like `scheme://host[:port][/path]`.
    ///
    /// A missing or unparsable port falls back to [`DEFAULT_VNC_PORT`].
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let authority = match raw.split_once("://") {
            Some((_, rest)) => rest,
            None => raw,
        };
        let authority = authority
            .split(|c| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        // Drop userinfo
        let authority = authority.rsplit('@').next().unwrap_or_default();

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // Bracketed IPv6
            match rest.split_once(']') {
                Some((host, tail)) => (host, tail.strip_prefix(':')),
                None => return Err(Error::InvalidTarget(raw.to_string())),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidTarget(raw.to_string()));
        }

        let port = port
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_VNC_PORT);

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Address suitable for `TcpStream::connect`
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Open a TCP connection, bounded by `timeout`
    pub async fn connect(&self, timeout: Duration) -> Result<TcpStream> {
        let addr = self.addr();
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::BridgeUpstream(format!("connect {addr}: {e}"))),
            Err(_) => Err(Error::ProbeTimeout {
                target: addr,
                millis: timeout.as_millis() as u64,
            }),
        }
    }
}

impl fmt::Display for BridgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Lifecycle of a bridge session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Things that happen to a bridge session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    UpstreamConnected,
    ConnectFailed,
    ClientClosed,
    ClientError,
    UpstreamClosed,
    UpstreamError,
    /// Both handles released
    Drained,
}

impl BridgeState {
    /// Transition table. Events that do not apply leave the state unchanged.
    pub fn on(self, event: BridgeEvent) -> BridgeState {
        use BridgeEvent::*;
        use BridgeState::*;

        match (self, event) {
            (Connecting, UpstreamConnected) => Open,
            (Connecting, ConnectFailed | ClientClosed | ClientError) => Closing,
            (Open, ClientClosed | ClientError | UpstreamClosed | UpstreamError) => Closing,
            (Closing, Drained) => Closed,
            (Closed, _) => Closed,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == BridgeState::Closed
    }
}

/// One browser client paired with one VNC upstream
pub struct BridgeSession {
    instance_id: String,
    target: BridgeTarget,
    connect_timeout: Duration,
    state: BridgeState,
}

impl BridgeSession {
    /// Create a new bridge session
    pub fn new(instance_id: impl Into<String>, target: BridgeTarget, connect_timeout: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            target,
            connect_timeout,
            state: BridgeState::Connecting,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    fn apply(&mut self, event: BridgeEvent) {
        let next = self.state.on(event);
        if next != self.state {
            trace!(
                instance = %self.instance_id,
                "bridge {:?} --{:?}--> {:?}", self.state, event, next
            );
        }
        self.state = next;
    }

    /// Bridge a WebSocket to the VNC server.
    ///
    /// Never returns an error: failures end the session and are logged.
    pub async fn run(mut self, socket: WebSocket) -> BridgeState {
        debug!(instance = %self.instance_id, "Connecting to VNC server at {}", self.target);

        let vnc_stream = match self.target.connect(self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(instance = %self.instance_id, "VNC connection failed: {}", e);
                self.apply(BridgeEvent::ConnectFailed);
                let _ = socket.close().await;
                self.apply(BridgeEvent::Drained);
                return self.state;
            }
        };
        let _ = vnc_stream.set_nodelay(true);
        self.apply(BridgeEvent::UpstreamConnected);
        debug!(instance = %self.instance_id, "Connected to VNC server");

        let (vnc_read, vnc_write) = vnc_stream.into_split();
        let (ws_write, ws_read) = socket.split();

        let ws_to_vnc = forward_ws_to_vnc(ws_read, vnc_write);
        let vnc_to_ws = forward_vnc_to_ws(vnc_read, ws_write);

        // Whichever side finishes first drops the other: the pending
        // VNC->WS future can no longer send on a closed client, and the
        // dropped TCP halves close the upstream.
        let (event, bytes) = tokio::select! {
            (event, bytes) = ws_to_vnc => (event, bytes),
            (event, bytes) = vnc_to_ws => (event, bytes),
        };
        self.apply(event);
        self.apply(BridgeEvent::Drained);

        debug!(
            instance = %self.instance_id,
            "VNC bridge session ended ({:?}, {} bytes on the closing direction)", event, bytes
        );
        self.state
    }
}

/// Forward WebSocket messages to VNC
async fn forward_ws_to_vnc(
    mut ws_read: SplitStream<WebSocket>,
    mut vnc_write: OwnedWriteHalf,
) -> (BridgeEvent, u64) {
    let mut relayed = 0u64;

    while let Some(msg) = ws_read.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            // Some clients send the RFB version string as text
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by client");
                return (BridgeEvent::ClientClosed, relayed);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                debug!("WebSocket error: {}", e);
                return (BridgeEvent::ClientError, relayed);
            }
        };

        trace!("WS->VNC: {} bytes", data.len());
        if let Err(e) = vnc_write.write_all(&data).await {
            debug!("VNC write failed: {}", e);
            return (BridgeEvent::UpstreamError, relayed);
        }
        relayed += data.len() as u64;
    }

    (BridgeEvent::ClientClosed, relayed)
}

/// Forward VNC data to WebSocket
async fn forward_vnc_to_ws(
    mut vnc_read: OwnedReadHalf,
    mut ws_write: SplitSink<WebSocket, Message>,
) -> (BridgeEvent, u64) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut relayed = 0u64;

    let event = loop {
        let n = match vnc_read.read(&mut buffer).await {
            Ok(0) => {
                debug!("VNC server closed connection");
                break BridgeEvent::UpstreamClosed;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("VNC read failed: {}", e);
                break BridgeEvent::UpstreamError;
            }
        };

        trace!("VNC->WS: {} bytes", n);
        if let Err(e) = ws_write.send(Message::Binary(buffer[..n].to_vec())).await {
            debug!("Failed to send to WebSocket: {}", e);
            return (BridgeEvent::ClientError, relayed);
        }
        relayed += n as u64;
    };

    let _ = ws_write.close().await;
    (event, relayed)
}
