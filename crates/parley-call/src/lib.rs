//! Client-side call library: per-peer negotiation sessions driving an
//! underlying transport to a connected state, plus ICE server resolution.
//!
//! The relay only carries signaling; everything in this crate runs on the
//! participant's side of the wire.

pub mod endpoint;
pub mod ice;
pub mod negotiation;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SDP payload exchanged through the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A proposed network path for connectivity establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Which outgoing video source the transport should be sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Camera,
    Screen,
}

/// Signaling message produced by a negotiation session, addressed to one
/// remote participant. The caller ships these through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: String,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no video sender to replace")]
    NoVideoSender,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("signal queue closed")]
    OutboxClosed,
}
