//! Signaling relay: validates room membership and forwards negotiation
//! messages and lifecycle events between participants.
//!
//! All state mutation goes through the connection registry and the room bus;
//! every broadcast crosses the bus even when sender and receiver share a
//! process, so the relay never assumes same-process delivery. Each
//! membership gets its own forwarding task whose bus subscription is taken
//! at join time: a broadcast receiver only observes messages sent after
//! subscription, so a late joiner can never be handed traffic that predates
//! its membership.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use room_bus::{MemberRecord, RoomBus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::policy::{AccessPolicy, Role};
use crate::registry::{ConnectionId, ConnectionRegistry, MessageSender, RoomMeta};
use crate::signaling::{call_room, user_room, ClientMessage, ParticipantInfo, ServerMessage};

/// What travels over the bus: the message plus enough routing context for
/// any process to apply exclude/target filters locally.
#[derive(Debug, Serialize, Deserialize)]
struct BusEnvelope {
    origin: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_user: Option<String>,
    message: ServerMessage,
}

pub struct RelayState {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn RoomBus>,
    policy: Arc<AccessPolicy>,
    // One forwarding task per (connection, room) membership.
    member_tasks: DashMap<(ConnectionId, String), JoinHandle<()>>,
    // One personal-channel task per connection, for out-of-room rings.
    personal_tasks: DashMap<ConnectionId, JoinHandle<()>>,
}

impl RelayState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn RoomBus>,
        policy: Arc<AccessPolicy>,
    ) -> Self {
        Self {
            registry,
            bus,
            policy,
            member_tasks: DashMap::new(),
            personal_tasks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind an authenticated connection and attach its personal notification
    /// channel. Identity is immutable from here on.
    pub async fn register_connection(
        &self,
        connection_id: ConnectionId,
        identity: String,
        tx: MessageSender,
    ) {
        self.registry
            .bind(connection_id.clone(), identity.clone(), tx.clone());

        let rx = self.bus.subscribe(&user_room(&identity)).await;
        let handle = tokio::spawn(forward_to_member(rx, connection_id.clone(), identity, tx));
        self.personal_tasks.insert(connection_id, handle);
    }

    /// Synthesize `leave` for every room the connection belonged to, then
    /// discard its state. Never fails; notification is best-effort.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some((_, handle)) = self.personal_tasks.remove(connection_id) {
            handle.abort();
        }
        let Some((identity, memberships)) = self.registry.unbind(connection_id) else {
            return;
        };
        for (room, _meta) in memberships {
            self.detach_member_task(connection_id, &room);
            if let Err(err) = self.bus.retract(&room, connection_id).await {
                warn!(room, error = %err, "failed to retract membership on disconnect");
            }
            self.publish(
                &room,
                connection_id,
                None,
                ServerMessage::PeerLeft {
                    call_id: room_scope_id(&room),
                    user_id: identity.clone(),
                },
            )
            .await;
        }
        debug!(connection_id, identity, "connection cleaned up");
    }

    /// Single dispatch point for every client-originated event.
    pub async fn handle_message(&self, connection_id: &ConnectionId, message: ClientMessage) {
        let Some(identity) = self.registry.identity(connection_id) else {
            // Unbound connections cannot act; the handshake enforces this.
            return;
        };

        match message {
            ClientMessage::Join {
                call_id,
                anonymized,
            } => {
                self.handle_join(connection_id, &identity, call_id, anonymized)
                    .await;
            }
            ClientMessage::Leave { call_id } => {
                self.handle_leave(connection_id, &identity, &call_id).await;
            }
            ClientMessage::Offer {
                call_id,
                target_user_id,
                description,
            } => {
                let message = ServerMessage::Offer {
                    call_id: call_id.clone(),
                    from: identity,
                    description,
                };
                self.forward_in_room(connection_id, &call_id, target_user_id, message)
                    .await;
            }
            ClientMessage::Answer {
                call_id,
                target_user_id,
                description,
            } => {
                let message = ServerMessage::Answer {
                    call_id: call_id.clone(),
                    from: identity,
                    description,
                };
                self.forward_in_room(connection_id, &call_id, target_user_id, message)
                    .await;
            }
            ClientMessage::Ice {
                call_id,
                target_user_id,
                candidate,
            } => {
                let message = ServerMessage::Ice {
                    call_id: call_id.clone(),
                    from: identity,
                    candidate,
                };
                self.forward_in_room(connection_id, &call_id, target_user_id, message)
                    .await;
            }
            ClientMessage::Meta {
                call_id,
                anonymized,
            } => {
                self.handle_meta(connection_id, &identity, &call_id, anonymized)
                    .await;
            }
            ClientMessage::Ring {
                call_id,
                target_user_id,
            } => {
                self.handle_ring(connection_id, &identity, &call_id, &target_user_id)
                    .await;
            }
            ClientMessage::RingApp { call_id } => {
                self.handle_ring_app(connection_id, &identity, &call_id)
                    .await;
            }
            ClientMessage::CodeUpdate { call_id, payload } => {
                let message = ServerMessage::CodeUpdate {
                    call_id: call_id.clone(),
                    from: identity,
                    payload,
                };
                self.forward_in_room(connection_id, &call_id, None, message)
                    .await;
            }
            ClientMessage::WbStroke { call_id, payload } => {
                let message = ServerMessage::WbStroke {
                    call_id: call_id.clone(),
                    from: identity,
                    payload,
                };
                self.forward_in_room(connection_id, &call_id, None, message)
                    .await;
            }
            ClientMessage::WbClear { call_id } => {
                let message = ServerMessage::WbClear {
                    call_id: call_id.clone(),
                    from: identity,
                };
                self.forward_in_room(connection_id, &call_id, None, message)
                    .await;
            }
            ClientMessage::Ping => {
                self.registry.touch(connection_id);
                self.send_to(connection_id, ServerMessage::Pong);
            }
        }
    }

    async fn handle_join(
        &self,
        connection_id: &ConnectionId,
        identity: &str,
        call_id: String,
        anonymized: bool,
    ) {
        let role = match self.policy.authorize(&call_id, identity).await {
            Ok(role) => role,
            Err(err) => {
                debug!(call_id, identity, error = %err, "join rejected");
                self.send_to(
                    connection_id,
                    ServerMessage::Error {
                        call_id: Some(call_id),
                        reason: err.to_string(),
                    },
                );
                return;
            }
        };

        let room = call_room(&call_id);
        // The connection may have unbound while authorization was in
        // flight; announcing it then would leak a member nothing retracts.
        let Some(newly_joined) =
            self.registry
                .join(connection_id, &room, RoomMeta { role, anonymized })
        else {
            debug!(room, "connection unbound mid-join; skipping");
            return;
        };
        if newly_joined {
            self.attach_member_task(connection_id, identity, &room).await;
        }

        let record = MemberRecord {
            connection_id: connection_id.clone(),
            user_id: identity.to_string(),
            role: role.as_str().to_string(),
            anonymized,
        };
        if let Err(err) = self.bus.announce(&room, record).await {
            warn!(room, error = %err, "failed to announce membership");
        }

        let members = match self.bus.members(&room).await {
            Ok(members) => members,
            Err(err) => {
                warn!(room, error = %err, "failed to read room membership");
                Vec::new()
            }
        };
        let members = members
            .into_iter()
            .filter(|m| m.connection_id != *connection_id)
            .filter_map(|m| {
                Role::parse(&m.role).map(|role| ParticipantInfo {
                    user_id: m.user_id,
                    role,
                    anonymized: m.anonymized,
                })
            })
            .collect();

        self.send_to(
            connection_id,
            ServerMessage::Participants {
                call_id: call_id.clone(),
                members,
            },
        );
        self.publish(
            &room,
            connection_id,
            None,
            ServerMessage::PeerJoined {
                call_id,
                user_id: identity.to_string(),
                role,
                anonymized,
            },
        )
        .await;
    }

    async fn handle_leave(&self, connection_id: &ConnectionId, identity: &str, call_id: &str) {
        let room = call_room(call_id);
        if !self.registry.leave(connection_id, &room) {
            debug!(room, "leave from non-member; ignoring");
            return;
        }
        self.detach_member_task(connection_id, &room);
        if let Err(err) = self.bus.retract(&room, connection_id).await {
            warn!(room, error = %err, "failed to retract membership");
        }
        self.publish(
            &room,
            connection_id,
            None,
            ServerMessage::PeerLeft {
                call_id: call_id.to_string(),
                user_id: identity.to_string(),
            },
        )
        .await;
    }

    async fn handle_meta(
        &self,
        connection_id: &ConnectionId,
        identity: &str,
        call_id: &str,
        anonymized: bool,
    ) {
        let room = call_room(call_id);
        let Some(meta) = self.registry.update_meta(connection_id, &room, anonymized) else {
            debug!(room, "meta update from non-member; dropping");
            return;
        };
        // Keep the distributed membership view in sync with the flag.
        let record = MemberRecord {
            connection_id: connection_id.clone(),
            user_id: identity.to_string(),
            role: meta.role.as_str().to_string(),
            anonymized,
        };
        if let Err(err) = self.bus.announce(&room, record).await {
            warn!(room, error = %err, "failed to refresh membership record");
        }
        self.publish(
            &room,
            connection_id,
            None,
            ServerMessage::Meta {
                call_id: call_id.to_string(),
                user_id: identity.to_string(),
                anonymized,
            },
        )
        .await;
    }

    async fn handle_ring(
        &self,
        connection_id: &ConnectionId,
        identity: &str,
        call_id: &str,
        target_user_id: &str,
    ) {
        if let Err(err) = self.policy.authorize(call_id, identity).await {
            self.send_to(
                connection_id,
                ServerMessage::Error {
                    call_id: Some(call_id.to_string()),
                    reason: err.to_string(),
                },
            );
            return;
        }
        self.publish(
            &user_room(target_user_id),
            connection_id,
            None,
            ServerMessage::Ring {
                call_id: call_id.to_string(),
                from: identity.to_string(),
            },
        )
        .await;
    }

    async fn handle_ring_app(&self, connection_id: &ConnectionId, identity: &str, call_id: &str) {
        if let Err(err) = self.policy.authorize(call_id, identity).await {
            self.send_to(
                connection_id,
                ServerMessage::Error {
                    call_id: Some(call_id.to_string()),
                    reason: err.to_string(),
                },
            );
            return;
        }
        let identities = match self.policy.authorized_identities(call_id).await {
            Ok(identities) => identities,
            Err(err) => {
                warn!(call_id, error = %err, "ring-broadcast lookup failed");
                return;
            }
        };
        for target in identities.iter().filter(|id| id.as_str() != identity) {
            self.publish(
                &user_room(target),
                connection_id,
                None,
                ServerMessage::Ring {
                    call_id: call_id.to_string(),
                    from: identity.to_string(),
                },
            )
            .await;
        }
    }

    /// Forward a signaling payload to the room, but only if the sender is a
    /// member. Non-member signaling is dropped without a reply so room
    /// existence never leaks.
    async fn forward_in_room(
        &self,
        connection_id: &ConnectionId,
        call_id: &str,
        target_user_id: Option<String>,
        message: ServerMessage,
    ) {
        let room = call_room(call_id);
        if self.registry.meta(connection_id, &room).is_none() {
            debug!(room, "signaling from non-member; dropping");
            return;
        }
        self.publish(&room, connection_id, target_user_id, message)
            .await;
    }

    async fn publish(
        &self,
        room: &str,
        origin: &ConnectionId,
        target_user: Option<String>,
        message: ServerMessage,
    ) {
        let envelope = BusEnvelope {
            origin: origin.clone(),
            target_user,
            message,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(room, error = %err, "failed to encode bus envelope");
                return;
            }
        };
        // Best effort: fanout failures are isolated to this room.
        if let Err(err) = self.bus.publish(room, bytes).await {
            warn!(room, error = %err, "bus publish failed");
        }
    }

    fn send_to(&self, connection_id: &ConnectionId, message: ServerMessage) {
        if let Some(tx) = self.registry.sender(connection_id) {
            let _ = tx.send(message);
        }
    }

    /// Start forwarding room traffic to one member. The subscription is
    /// taken here, at join time, so the member sees everything published
    /// after its membership and nothing from before it.
    async fn attach_member_task(
        &self,
        connection_id: &ConnectionId,
        identity: &str,
        room: &str,
    ) {
        let Some(tx) = self.registry.sender(connection_id) else {
            return;
        };
        let rx = self.bus.subscribe(room).await;
        let handle = tokio::spawn(forward_to_member(
            rx,
            connection_id.clone(),
            identity.to_string(),
            tx,
        ));
        if let Some(previous) = self
            .member_tasks
            .insert((connection_id.clone(), room.to_string()), handle)
        {
            previous.abort();
        }
    }

    fn detach_member_task(&self, connection_id: &ConnectionId, room: &str) {
        if let Some((_, handle)) = self
            .member_tasks
            .remove(&(connection_id.clone(), room.to_string()))
        {
            handle.abort();
        }
    }
}

/// Deliver bus traffic for one room subscription to one connection,
/// applying the envelope's exclude/target filters.
async fn forward_to_member(
    mut rx: broadcast::Receiver<room_bus::BusMessage>,
    connection_id: ConnectionId,
    identity: String,
    tx: MessageSender,
) {
    loop {
        let bus_message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(connection_id, skipped, "room fanout lagged; messages dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let envelope: BusEnvelope = match serde_json::from_slice(&bus_message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "discarding undecodable envelope");
                continue;
            }
        };
        if envelope.origin == connection_id {
            continue;
        }
        if let Some(target) = &envelope.target_user {
            if *target != identity {
                continue;
            }
        }
        if tx.send(envelope.message).is_err() {
            break;
        }
    }
}

/// `call:app-1` -> `app-1`; used when synthesizing leave events.
fn room_scope_id(room: &str) -> String {
    room.split_once(':')
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| room.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ApplicationAggregate, StaticDirectory};
    use crate::registry::generate_connection_id;
    use room_bus::LocalBus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn test_state() -> Arc<RelayState> {
        let directory = StaticDirectory::new().with_application(
            "app-1",
            ApplicationAggregate {
                candidate_id: "alice".into(),
                employer_id: "bob".into(),
                team_ids: vec!["carol".into()],
            },
        );
        Arc::new(RelayState::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(LocalBus::new()),
            Arc::new(AccessPolicy::new(Arc::new(directory))),
        ))
    }

    async fn connect(
        state: &RelayState,
        identity: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = generate_connection_id();
        state
            .register_connection(connection_id.clone(), identity.to_string(), tx)
            .await;
        (connection_id, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message within deadline")
            .expect("channel open")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "expected no message");
    }

    fn join(call_id: &str) -> ClientMessage {
        ClientMessage::Join {
            call_id: call_id.into(),
            anonymized: false,
        }
    }

    #[tokio::test]
    async fn two_party_join_offer_and_disconnect_scenario() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;

        // A joins first and sees an empty room.
        state.handle_message(&a, join("app-1")).await;
        let ServerMessage::Participants { members, .. } = recv(&mut a_rx).await else {
            panic!("expected participants");
        };
        assert!(members.is_empty());

        // B joins second: A learns about B, B sees A.
        state.handle_message(&b, join("app-1")).await;
        let ServerMessage::Participants { members, .. } = recv(&mut b_rx).await else {
            panic!("expected participants");
        };
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "alice");
        assert_eq!(members[0].role, Role::Candidate);

        let ServerMessage::PeerJoined { user_id, role, .. } = recv(&mut a_rx).await else {
            panic!("expected peer-joined");
        };
        assert_eq!(user_id, "bob");
        assert_eq!(role, Role::Employer);

        // A's targeted offer reaches B verbatim, tagged with the sender.
        state
            .handle_message(
                &a,
                ClientMessage::Offer {
                    call_id: "app-1".into(),
                    target_user_id: Some("bob".into()),
                    description: json!({"kind": "offer", "sdp": "v=0..."}),
                },
            )
            .await;
        let ServerMessage::Offer {
            from, description, ..
        } = recv(&mut b_rx).await
        else {
            panic!("expected offer");
        };
        assert_eq!(from, "alice");
        assert_eq!(description["sdp"], "v=0...");

        // B disconnects; A gets exactly one peer-left.
        state.disconnect(&b).await;
        let ServerMessage::PeerLeft { user_id, call_id } = recv(&mut a_rx).await else {
            panic!("expected peer-left");
        };
        assert_eq!(user_id, "bob");
        assert_eq!(call_id, "app-1");
        assert_silent(&mut a_rx).await;
    }

    #[tokio::test]
    async fn late_joiner_does_not_receive_traffic_published_before_join() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;

        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await; // participants
        // Room traffic that predates bob's membership.
        state
            .handle_message(
                &a,
                ClientMessage::WbStroke {
                    call_id: "app-1".into(),
                    payload: json!({"points": [[1, 1]]}),
                },
            )
            .await;

        state.handle_message(&b, join("app-1")).await;
        let ServerMessage::Participants { members, .. } = recv(&mut b_rx).await else {
            panic!("expected participants");
        };
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "alice");
        // Neither alice's join broadcast nor her stroke leaks to the
        // snapshot-plus-subscription joiner.
        assert_silent(&mut b_rx).await;
    }

    #[tokio::test]
    async fn forbidden_join_mutates_nothing_and_broadcasts_nothing() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (m, mut m_rx) = connect(&state, "mallory").await;

        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await; // participants

        state.handle_message(&m, join("app-1")).await;
        let ServerMessage::Error { call_id, reason } = recv(&mut m_rx).await else {
            panic!("expected error");
        };
        assert_eq!(call_id.as_deref(), Some("app-1"));
        assert_eq!(reason, "not a party to this call");

        assert_silent(&mut a_rx).await;
        let members = state.bus.members("call:app-1").await.expect("members ok");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "alice");
    }

    #[tokio::test]
    async fn missing_call_is_reported_as_not_found() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        state.handle_message(&a, join("app-404")).await;
        let ServerMessage::Error { reason, .. } = recv(&mut a_rx).await else {
            panic!("expected error");
        };
        assert_eq!(reason, "call not found");
    }

    #[tokio::test]
    async fn signaling_from_non_member_is_silently_dropped() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;
        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await;

        // bob is authorized but never joined: his offer must vanish without
        // an error reply, and alice must see nothing.
        state
            .handle_message(
                &b,
                ClientMessage::Offer {
                    call_id: "app-1".into(),
                    target_user_id: None,
                    description: json!({"sdp": "x"}),
                },
            )
            .await;
        assert_silent(&mut b_rx).await;
        assert_silent(&mut a_rx).await;
    }

    #[tokio::test]
    async fn rejoin_updates_metadata_without_duplicating_membership() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await;

        state
            .handle_message(
                &a,
                ClientMessage::Join {
                    call_id: "app-1".into(),
                    anonymized: true,
                },
            )
            .await;
        recv(&mut a_rx).await; // fresh participants snapshot

        let members = state.bus.members("call:app-1").await.expect("members ok");
        assert_eq!(members.len(), 1);
        assert!(members[0].anonymized);
    }

    #[tokio::test]
    async fn meta_update_reaches_other_members_without_reauthorization() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;
        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await;
        state.handle_message(&b, join("app-1")).await;
        recv(&mut b_rx).await;
        recv(&mut a_rx).await; // peer-joined bob

        state
            .handle_message(
                &a,
                ClientMessage::Meta {
                    call_id: "app-1".into(),
                    anonymized: true,
                },
            )
            .await;
        let ServerMessage::Meta {
            user_id,
            anonymized,
            ..
        } = recv(&mut b_rx).await
        else {
            panic!("expected meta");
        };
        assert_eq!(user_id, "alice");
        assert!(anonymized);
        // Sender does not get an echo.
        assert_silent(&mut a_rx).await;
    }

    #[tokio::test]
    async fn explicit_leave_notifies_remaining_members() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;
        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await;
        state.handle_message(&b, join("app-1")).await;
        recv(&mut b_rx).await;
        recv(&mut a_rx).await;

        state
            .handle_message(
                &b,
                ClientMessage::Leave {
                    call_id: "app-1".into(),
                },
            )
            .await;
        let ServerMessage::PeerLeft { user_id, .. } = recv(&mut a_rx).await else {
            panic!("expected peer-left");
        };
        assert_eq!(user_id, "bob");

        let members = state.bus.members("call:app-1").await.expect("members ok");
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn ring_reaches_target_outside_any_room() {
        let state = test_state();
        let (a, _a_rx) = connect(&state, "alice").await;
        let (_b, mut b_rx) = connect(&state, "bob").await;

        // bob has not joined anything; the ring still lands.
        state
            .handle_message(
                &a,
                ClientMessage::Ring {
                    call_id: "app-1".into(),
                    target_user_id: "bob".into(),
                },
            )
            .await;
        let ServerMessage::Ring { call_id, from } = recv(&mut b_rx).await else {
            panic!("expected ring");
        };
        assert_eq!(call_id, "app-1");
        assert_eq!(from, "alice");
    }

    #[tokio::test]
    async fn unauthorized_ring_is_rejected() {
        let state = test_state();
        let (m, mut m_rx) = connect(&state, "mallory").await;
        let (_b, mut b_rx) = connect(&state, "bob").await;

        state
            .handle_message(
                &m,
                ClientMessage::Ring {
                    call_id: "app-1".into(),
                    target_user_id: "bob".into(),
                },
            )
            .await;
        let ServerMessage::Error { .. } = recv(&mut m_rx).await else {
            panic!("expected error");
        };
        assert_silent(&mut b_rx).await;
    }

    #[tokio::test]
    async fn ring_broadcast_reaches_every_party_except_sender() {
        let state = test_state();
        let (b, mut b_rx) = connect(&state, "bob").await;
        let (_a, mut a_rx) = connect(&state, "alice").await;
        let (_c, mut c_rx) = connect(&state, "carol").await;

        state
            .handle_message(
                &b,
                ClientMessage::RingApp {
                    call_id: "app-1".into(),
                },
            )
            .await;

        let ServerMessage::Ring { from, .. } = recv(&mut a_rx).await else {
            panic!("expected ring");
        };
        assert_eq!(from, "bob");
        let ServerMessage::Ring { .. } = recv(&mut c_rx).await else {
            panic!("expected ring");
        };
        assert_silent(&mut b_rx).await;
    }

    #[tokio::test]
    async fn whiteboard_events_relay_to_room_members_only() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        let (b, mut b_rx) = connect(&state, "bob").await;
        state.handle_message(&a, join("app-1")).await;
        recv(&mut a_rx).await;
        state.handle_message(&b, join("app-1")).await;
        recv(&mut b_rx).await;
        recv(&mut a_rx).await;

        state
            .handle_message(
                &a,
                ClientMessage::WbStroke {
                    call_id: "app-1".into(),
                    payload: json!({"points": [[0, 0], [4, 2]]}),
                },
            )
            .await;
        let ServerMessage::WbStroke { from, payload, .. } = recv(&mut b_rx).await else {
            panic!("expected stroke");
        };
        assert_eq!(from, "alice");
        assert_eq!(payload["points"][1][0], 4);

        state
            .handle_message(
                &a,
                ClientMessage::WbClear {
                    call_id: "app-1".into(),
                },
            )
            .await;
        let ServerMessage::WbClear { from, .. } = recv(&mut b_rx).await else {
            panic!("expected clear");
        };
        assert_eq!(from, "alice");
    }

    #[tokio::test]
    async fn ping_updates_heartbeat_and_pongs() {
        let state = test_state();
        let (a, mut a_rx) = connect(&state, "alice").await;
        state.handle_message(&a, ClientMessage::Ping).await;
        assert_eq!(recv(&mut a_rx).await, ServerMessage::Pong);
    }
}
