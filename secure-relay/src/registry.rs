use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tracing::{debug, warn};

use crate::{
    crypto::SessionKey,
    error::{RelayError, RelayResult},
    protocol::SERVER_ORIGIN,
    transport::seal_line,
};

/// Frames a peer may fall behind by before further lines to it are dropped.
pub const OUTBOUND_CAPACITY: usize = 128;

/// Queue of encrypted frames waiting to be written to one peer.
pub type OutboundSink = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One plaintext chat line, attributed to a peer or to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub origin: String,
    pub body: String,
}

impl ChatEvent {
    pub fn from_peer(display_name: &str, body: impl Into<String>) -> Self {
        Self {
            origin: display_name.to_string(),
            body: body.into(),
        }
    }

    pub fn system(body: impl Into<String>) -> Self {
        Self {
            origin: SERVER_ORIGIN.to_string(),
            body: body.into(),
        }
    }
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.body)
    }
}

/// A live, fully handshaken connection as seen by the broadcaster.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    id: ConnectionId,
    display_name: String,
    session_key: Arc<SessionKey>,
    sink: OutboundSink,
}

impl ConnectionRecord {
    pub fn new(
        id: ConnectionId,
        display_name: String,
        session_key: Arc<SessionKey>,
        sink: OutboundSink,
    ) -> Self {
        Self {
            id,
            display_name,
            session_key,
            sink,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Encrypts `plain` under this connection's own key and queues it.
    ///
    /// Never waits: a full queue drops this line for this peer only.
    pub fn deliver(&self, plain: &str) -> RelayResult<()> {
        let frame = seal_line(plain, &self.session_key)?;
        match self.sink.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection = %self.id, nickname = %self.display_name, "peer is lagging; dropping line");
                Err(RelayError::lagging("outbound queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::closed("outbound queue closed")),
        }
    }
}

/// The set of active connections. All access goes through its lock, so
/// callers never synchronise on their own.
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Publishes a finished record; broadcasts that start after this returns will see it.
    pub async fn register(&self, record: ConnectionRecord) {
        let mut connections = self.connections.lock().await;
        connections.insert(record.id, record);
    }

    /// Removes a record. Only the first call for an id returns it.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let mut connections = self.connections.lock().await;
        connections.remove(&id)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn display_names(&self) -> Vec<String> {
        let connections = self.connections.lock().await;
        let mut names: Vec<String> = connections
            .values()
            .map(|record| record.display_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sends `event` to every registered connection except `exclude`, each copy
    /// encrypted under the recipient's key. Returns how many copies were queued.
    ///
    /// Works on a snapshot: connections registered meanwhile are skipped, and a
    /// connection removed meanwhile may still get this one last line.
    pub async fn broadcast(&self, event: &ChatEvent, exclude: Option<ConnectionId>) -> usize {
        let recipients: Vec<ConnectionRecord> = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .filter(|record| Some(record.id) != exclude)
                .cloned()
                .collect()
        };

        let line = event.to_string();
        let mut delivered = 0;
        for record in &recipients {
            match record.deliver(&line) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(connection = %record.id, nickname = %record.display_name, %error, "dropping broadcast for recipient");
                }
            }
        }
        delivered
    }
}
