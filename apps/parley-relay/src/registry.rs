//! Connection registry: binds live connections to identities and tracks
//! per-room membership metadata on this process.
//!
//! The cross-process membership view lives on the bus; delivery happens
//! through per-membership forwarding tasks, so this registry only answers
//! identity, metadata, and liveness questions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::policy::Role;
use crate::signaling::ServerMessage;

pub type ConnectionId = String;
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMeta {
    pub role: Role,
    pub anonymized: bool,
}

struct Registered {
    identity: String,
    tx: MessageSender,
    rooms: HashMap<String, RoomMeta>,
    last_heartbeat: Arc<RwLock<Instant>>,
}

pub fn generate_connection_id() -> ConnectionId {
    Uuid::new_v4().to_string()
}

/// Narrow, internally-synchronized shared state. Callers never reach into
/// another connection's entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Registered>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate an identity with a connection for its lifetime.
    pub fn bind(&self, connection_id: ConnectionId, identity: String, tx: MessageSender) {
        self.connections.insert(
            connection_id,
            Registered {
                identity,
                tx,
                rooms: HashMap::new(),
                last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            },
        );
    }

    pub fn identity(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.identity.clone())
    }

    pub fn sender(&self, connection_id: &str) -> Option<MessageSender> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.tx.clone())
    }

    /// Record membership metadata. Idempotent: re-joining updates the
    /// metadata instead of duplicating membership. Returns `Some(true)` for
    /// a new membership, `Some(false)` for an upsert, and `None` when the
    /// connection is no longer bound.
    pub fn join(&self, connection_id: &str, room: &str, meta: RoomMeta) -> Option<bool> {
        let mut entry = self.connections.get_mut(connection_id)?;
        Some(entry.rooms.insert(room.to_string(), meta).is_none())
    }

    /// Remove a membership. No-op (returns `false`) if not a member.
    pub fn leave(&self, connection_id: &str, room: &str) -> bool {
        self.connections
            .get_mut(connection_id)
            .map(|mut entry| entry.rooms.remove(room).is_some())
            .unwrap_or(false)
    }

    pub fn meta(&self, connection_id: &str, room: &str) -> Option<RoomMeta> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.rooms.get(room).cloned())
    }

    /// Update the privacy flag for an existing membership.
    pub fn update_meta(&self, connection_id: &str, room: &str, anonymized: bool) -> Option<RoomMeta> {
        let mut entry = self.connections.get_mut(connection_id)?;
        let meta = entry.rooms.get_mut(room)?;
        meta.anonymized = anonymized;
        Some(meta.clone())
    }

    pub fn touch(&self, connection_id: &str) {
        if let Some(entry) = self.connections.get(connection_id) {
            *entry.last_heartbeat.write() = Instant::now();
        }
    }

    /// Connections whose last heartbeat is older than `timeout`.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.last_heartbeat.read().elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Atomically drain every membership of a disconnecting connection so
    /// cleanup is all-or-nothing per room.
    pub fn unbind(&self, connection_id: &str) -> Option<(String, Vec<(String, RoomMeta)>)> {
        let (_, registered) = self.connections.remove(connection_id)?;
        Some((registered.identity, registered.rooms.into_iter().collect()))
    }
}
