//! Active-focus store
//!
//! Persists the ordered list of in-focus instance ids and pushes every
//! change to the `/active` subscribers.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use loco_common::{ActiveIds, ActiveSelection, Result, MAX_ACTIVE_INSTANCES};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace, warn};

const SUBSCRIBER_BUFFER: usize = 32;

/// Persisted active-focus state with change broadcast
pub struct ActiveFocusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    tx: broadcast::Sender<Vec<String>>,
}

impl ActiveFocusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current active ids.
    ///
    /// Tolerates a list, a single id, a bare list file, or a missing or
    /// corrupt file. A missing file is created empty.
    pub async fn read(&self) -> Vec<String> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_persisted(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.create_if_missing().await,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Create the empty file under the write lock, unless a write got there first
    async fn create_if_missing(&self) -> Vec<String> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_persisted(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Err(e) = self.persist(&[]).await {
                    warn!("Failed to create {}: {}", self.path.display(), e);
                }
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Replace the active ids, persist, and broadcast the stored list
    pub async fn write(&self, selection: ActiveSelection) -> Result<Vec<String>> {
        let ids = selection.truncated().into_ids();

        // Held across the broadcast so subscribers see writes in file order
        let _guard = self.write_lock.lock().await;
        self.persist(&ids).await?;

        // No receivers is fine
        let _ = self.tx.send(ids.clone());
        debug!("Active instances: {:?}", ids);
        Ok(ids)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Callers hold `write_lock`; the temp file name is shared.
    async fn persist(&self, ids: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let body = serde_json::to_vec_pretty(&ActiveIds {
            active: ids.to_vec(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Serve one upgraded `/active` socket until it closes
    pub async fn serve(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let mut updates = self.subscribe();

        let current = self.read().await;
        if send_ids(&mut sender, current).await.is_err() {
            return;
        }

        let forward = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(ids) => {
                        if send_ids(&mut sender, ids).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        trace!("Active subscriber lagged by {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Ok(selection) = serde_json::from_str::<ActiveSelection>(&text) else {
                        trace!("Ignoring malformed active frame");
                        continue;
                    };
                    if let Err(e) = self.write(selection).await {
                        warn!("Failed to persist active instances: {}", e);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Active socket error: {}", e);
                    break;
                }
            }
        }

        forward.abort();
    }
}

async fn send_ids(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    ids: Vec<String>,
) -> std::result::Result<(), axum::Error> {
    let body = serde_json::to_string(&ActiveIds { active: ids }).unwrap_or_default();
    sender.send(Message::Text(body)).await
}

/// Decode any of the persisted shapes, never failing
fn parse_persisted(bytes: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return Vec::new();
    };
    let ids = match value {
        serde_json::Value::Object(mut obj) => obj.remove("active").unwrap_or_default(),
        other => other,
    };

    let mut ids = ActiveSelection::from_ids_value(&ids)
        .map(ActiveSelection::into_ids)
        .unwrap_or_default();
    ids.truncate(MAX_ACTIVE_INSTANCES);
    ids
}
