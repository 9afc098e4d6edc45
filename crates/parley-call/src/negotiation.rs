//! Perfect-negotiation state machine, one instance per remote peer.
//!
//! Both sides may start an offer at the same time (glare). The tie-break is
//! fixed per ordered peer pair: the side with the lexicographically smaller
//! `(user_id, connection_id)` tuple is impolite and its in-flight offer
//! wins; the polite side always yields and answers the remote offer instead.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::endpoint::SessionEndpoint;
use crate::{
    IceCandidate, NegotiationError, OutboundSignal, SessionDescription, SignalPayload,
    TrackSource,
};

/// Stable identity tuple used for the polite/impolite tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerTag {
    pub user_id: String,
    pub connection_id: String,
}

impl PeerTag {
    pub fn new(user_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

/// The smaller tuple leads (impolite); identical on both sides by
/// construction, so exactly one side of any pair is polite.
pub fn is_polite(local: &PeerTag, remote: &PeerTag) -> bool {
    local > remote
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stable,
    HaveLocalOffer,
    Answering,
    Closed,
}

/// What happened to an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    Answered,
    /// Glare, and this side is impolite: the offer was discarded.
    Ignored,
    /// Session already closed; late message dropped.
    Dropped,
}

pub struct PeerSession<E: SessionEndpoint> {
    remote_user: String,
    polite: bool,
    state: SessionState,
    making_offer: bool,
    ignore_offer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    endpoint: Arc<E>,
    outbox: mpsc::UnboundedSender<OutboundSignal>,
}

impl<E: SessionEndpoint> PeerSession<E> {
    pub fn new(
        local: PeerTag,
        remote: PeerTag,
        endpoint: Arc<E>,
        outbox: mpsc::UnboundedSender<OutboundSignal>,
    ) -> Self {
        let polite = is_polite(&local, &remote);
        debug!(
            remote_user = %remote.user_id,
            polite,
            "negotiation session created"
        );
        Self {
            remote_user: remote.user_id,
            polite,
            state: SessionState::Stable,
            making_offer: false,
            ignore_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            endpoint,
            outbox,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// The transport signalled that renegotiation is needed (initial setup,
    /// new track, screen-share swap). Creates, applies and sends an offer.
    pub async fn negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.making_offer = true;
        let result = self.make_offer().await;
        self.making_offer = false;
        result
    }

    async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self.endpoint.create_offer().await?;
        self.endpoint.set_local_description(offer.clone()).await?;
        self.state = SessionState::HaveLocalOffer;
        self.send(SignalPayload::Offer(offer))
    }

    /// Remote offer arrived. Collision with our own in-flight offer is
    /// resolved by the polite/impolite rule; the polite side's endpoint
    /// rolls back its local offer implicitly when the remote description is
    /// applied.
    pub async fn remote_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<OfferDisposition, NegotiationError> {
        if self.state == SessionState::Closed {
            return Ok(OfferDisposition::Dropped);
        }

        let collision = self.making_offer || self.state != SessionState::Stable;
        if collision && !self.polite {
            debug!(remote_user = %self.remote_user, "glare: ignoring remote offer");
            self.ignore_offer = true;
            return Ok(OfferDisposition::Ignored);
        }
        self.ignore_offer = false;

        self.state = SessionState::Answering;
        self.endpoint.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.drain_candidates().await;

        let answer = self.endpoint.create_answer().await?;
        self.endpoint.set_local_description(answer.clone()).await?;
        self.send(SignalPayload::Answer(answer))?;
        self.state = SessionState::Stable;
        Ok(OfferDisposition::Answered)
    }

    /// Remote answer arrived. Only valid while we have a local offer
    /// outstanding; anything else is late or belongs to a discarded
    /// exchange and is dropped.
    pub async fn remote_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state != SessionState::HaveLocalOffer {
            debug!(
                remote_user = %self.remote_user,
                state = ?self.state,
                "dropping answer outside of local-offer state"
            );
            return Ok(());
        }
        self.endpoint.set_remote_description(description).await?;
        self.remote_description_set = true;
        // The glare exchange (if any) is settled.
        self.ignore_offer = false;
        self.drain_candidates().await;
        self.state = SessionState::Stable;
        Ok(())
    }

    /// Remote ICE candidate arrived. Buffered until a remote description
    /// exists, even during glare: candidates are not bound to the discarded
    /// offer, so they stay queued for the description that eventually
    /// applies. A candidate that fails to apply is logged and dropped since
    /// connectivity may still succeed via other candidates.
    pub async fn remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == SessionState::Closed {
            return;
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn drain_candidates(&mut self) {
        // Drained exactly once, in arrival order; the buffer stays empty
        // afterwards because remote_description_set now routes candidates
        // straight to the endpoint.
        let queued = std::mem::take(&mut self.pending_candidates);
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.endpoint.add_ice_candidate(candidate).await {
            if self.ignore_offer {
                // Expected while a discarded offer's leftovers trickle in.
                debug!(remote_user = %self.remote_user, error = %err, "candidate from discarded exchange failed to apply");
            } else {
                warn!(remote_user = %self.remote_user, error = %err, "discarding unusable ice candidate");
            }
        }
    }

    /// Swap the outgoing video source. Reuses the existing transport; the
    /// endpoint's own renegotiation trigger resynchronizes the peers.
    pub async fn set_video_source(&self, source: TrackSource) -> Result<(), NegotiationError> {
        self.endpoint.replace_video_track(source).await?;
        Ok(())
    }

    /// Tear down the session. All signaling for this peer is dropped from
    /// here on.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.pending_candidates.clear();
        self.endpoint.close().await;
    }

    fn send(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        self.outbox
            .send(OutboundSignal {
                to: self.remote_user.clone(),
                payload,
            })
            .map_err(|_| NegotiationError::OutboxClosed)
    }
}
