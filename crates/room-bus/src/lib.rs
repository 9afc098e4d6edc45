//! Room fanout layer: publish/subscribe broadcast domains ("rooms") with a
//! cross-process membership view.
//!
//! Two implementations of the same [`RoomBus`] contract:
//! - [`LocalBus`] delivers within the current process only. Used by tests and
//!   by single-process deployments.
//! - [`RedisBus`] fans out through Redis pub/sub and keeps the member table in
//!   a Redis hash, so any process can publish to or enumerate a room
//!   regardless of which process holds a given connection.
//!
//! [`connect`] picks between them with a bounded timeout: an unreachable
//! Redis degrades to local-only fanout instead of failing startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Redis channel prefix for room fanout.
const FANOUT_PREFIX: &str = "parley:fanout:";
/// Redis key prefix for room member hashes.
const MEMBERS_PREFIX: &str = "parley:members:";
/// Safety TTL on member hashes so a crashed process cannot leak a room
/// forever. Refreshed on every announce.
const MEMBER_TTL_SECS: i64 = 3600;
/// Bound on any single Redis round-trip so a slow bus cannot stall a caller.
const BUS_OP_TIMEOUT: Duration = Duration::from_secs(5);

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub room: String,
    pub payload: Bytes,
}

/// Cross-process membership record for one connection in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub connection_id: String,
    pub user_id: String,
    pub role: String,
    pub anonymized: bool,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus upstream unavailable: {0}")]
    Upstream(String),
    #[error("bus operation timed out")]
    Timeout,
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Upstream(err.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Fanout contract shared by every deployment mode.
///
/// Ordering: per-publisher FIFO within a room; nothing is guaranteed across
/// publishers or across rooms. Delivery is at-most-once.
#[async_trait]
pub trait RoomBus: Send + Sync {
    /// Subscribe to a room's message stream. Receivers lag-drop under
    /// backpressure rather than block publishers.
    async fn subscribe(&self, room: &str) -> broadcast::Receiver<BusMessage>;

    /// Broadcast an opaque payload to every subscriber of `room`, on every
    /// process.
    async fn publish(&self, room: &str, payload: Bytes) -> BusResult<()>;

    /// Record a connection as a member of `room` (idempotent upsert).
    async fn announce(&self, room: &str, member: MemberRecord) -> BusResult<()>;

    /// Remove a connection's membership record. No-op if absent.
    async fn retract(&self, room: &str, connection_id: &str) -> BusResult<()>;

    /// Current members of `room` across all processes.
    async fn members(&self, room: &str) -> BusResult<Vec<MemberRecord>>;
}

type SenderMap = Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

fn sender_for(senders: &SenderMap, room: &str) -> broadcast::Sender<BusMessage> {
    let mut guard = senders.write();
    guard
        .entry(room.to_string())
        .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
        .clone()
}

/// In-process bus for tests and single-process deployments.
#[derive(Default)]
pub struct LocalBus {
    senders: SenderMap,
    members: RwLock<HashMap<String, HashMap<String, MemberRecord>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomBus for LocalBus {
    async fn subscribe(&self, room: &str) -> broadcast::Receiver<BusMessage> {
        sender_for(&self.senders, room).subscribe()
    }

    async fn publish(&self, room: &str, payload: Bytes) -> BusResult<()> {
        let sender = sender_for(&self.senders, room);
        // A room with no subscribers is not an error; the payload is simply
        // dropped, matching at-most-once semantics.
        let _ = sender.send(BusMessage {
            room: room.to_string(),
            payload,
        });
        Ok(())
    }

    async fn announce(&self, room: &str, member: MemberRecord) -> BusResult<()> {
        self.members
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(member.connection_id.clone(), member);
        Ok(())
    }

    async fn retract(&self, room: &str, connection_id: &str) -> BusResult<()> {
        let mut guard = self.members.write();
        if let Some(room_members) = guard.get_mut(room) {
            room_members.remove(connection_id);
            if room_members.is_empty() {
                guard.remove(room);
            }
        }
        Ok(())
    }

    async fn members(&self, room: &str) -> BusResult<Vec<MemberRecord>> {
        Ok(self
            .members
            .read()
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Redis-backed bus: `PUBLISH`/`PSUBSCRIBE` fanout plus a member hash per
/// room.
///
/// One background task owns the pubsub connection and feeds the same
/// per-room broadcast senders the local bus uses, so subscribers never touch
/// Redis directly. A publisher's own process receives its publishes back
/// through Redis like everyone else; there is no separate local echo path.
pub struct RedisBus {
    manager: ConnectionManager,
    senders: SenderMap,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client.clone()).await?;

        let senders: SenderMap = Arc::new(RwLock::new(HashMap::new()));
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{FANOUT_PREFIX}*")).await?;

        let task_senders = senders.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(room) = channel.strip_prefix(FANOUT_PREFIX) else {
                    continue;
                };
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(room, error = %err, "discarding undecodable bus payload");
                        continue;
                    }
                };
                let sender = sender_for(&task_senders, room);
                let _ = sender.send(BusMessage {
                    room: room.to_string(),
                    payload: Bytes::from(payload),
                });
            }
            debug!("redis pubsub stream ended");
        });

        Ok(Self { manager, senders })
    }

    fn members_key(room: &str) -> String {
        format!("{MEMBERS_PREFIX}{room}")
    }

    async fn bounded<T, F>(op: F) -> BusResult<T>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(BUS_OP_TIMEOUT, op).await {
            Ok(result) => result.map_err(BusError::from),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

#[async_trait]
impl RoomBus for RedisBus {
    async fn subscribe(&self, room: &str) -> broadcast::Receiver<BusMessage> {
        sender_for(&self.senders, room).subscribe()
    }

    async fn publish(&self, room: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let channel = format!("{FANOUT_PREFIX}{room}");
        Self::bounded(async move {
            conn.publish::<_, _, i64>(channel, payload.as_ref()).await
        })
        .await?;
        Ok(())
    }

    async fn announce(&self, room: &str, member: MemberRecord) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let key = Self::members_key(room);
        let field = member.connection_id.clone();
        let value = serde_json::to_string(&member)
            .map_err(|err| BusError::Upstream(err.to_string()))?;
        Self::bounded(async move {
            redis::pipe()
                .hset(&key, &field, &value)
                .ignore()
                .expire(&key, MEMBER_TTL_SECS)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn retract(&self, room: &str, connection_id: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let key = Self::members_key(room);
        let field = connection_id.to_string();
        Self::bounded(async move { conn.hdel::<_, _, i64>(key, field).await }).await?;
        Ok(())
    }

    async fn members(&self, room: &str) -> BusResult<Vec<MemberRecord>> {
        let mut conn = self.manager.clone();
        let key = Self::members_key(room);
        let raw: HashMap<String, String> =
            Self::bounded(async move { conn.hgetall(key).await }).await?;
        let mut members = Vec::with_capacity(raw.len());
        for (connection_id, value) in raw {
            match serde_json::from_str::<MemberRecord>(&value) {
                Ok(member) => members.push(member),
                Err(err) => {
                    warn!(room, connection_id, error = %err, "skipping corrupt member record");
                }
            }
        }
        Ok(members)
    }
}

/// Build the bus for this deployment. `None` or an unreachable Redis yields
/// a [`LocalBus`]: single-process fanout is a valid degraded configuration,
/// so startup never fails here.
pub async fn connect(redis_url: Option<&str>, connect_timeout: Duration) -> Arc<dyn RoomBus> {
    let Some(url) = redis_url else {
        info!("no redis url configured; using local-process fanout");
        return Arc::new(LocalBus::new());
    };

    match tokio::time::timeout(connect_timeout, RedisBus::connect(url)).await {
        Ok(Ok(bus)) => {
            info!("connected to redis fanout bus");
            Arc::new(bus)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "redis unreachable; degrading to local-process fanout");
            Arc::new(LocalBus::new())
        }
        Err(_) => {
            warn!(
                timeout_ms = connect_timeout.as_millis() as u64,
                "redis connect timed out; degrading to local-process fanout"
            );
            Arc::new(LocalBus::new())
        }
    }
}
