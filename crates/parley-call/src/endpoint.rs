//! Transport seam for the negotiation state machine.
//!
//! [`SessionEndpoint`] is the narrow contract the state machine drives;
//! [`RtcEndpoint`] implements it over a `webrtc` peer connection. Tests use
//! a mock instead, so nothing above this module touches the webrtc crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::debug;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::ice::IceServer;
use crate::{EndpointError, IceCandidate, SdpKind, SessionDescription, TrackSource};

/// Operations the negotiation state machine needs from the underlying
/// transport. `set_remote_description` must perform an implicit rollback of
/// any un-answered local offer, which is what lets the polite side yield
/// during glare.
#[async_trait]
pub trait SessionEndpoint: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EndpointError>;
    async fn create_answer(&self) -> Result<SessionDescription, EndpointError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EndpointError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EndpointError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError>;
    async fn replace_video_track(&self, source: TrackSource) -> Result<(), EndpointError>;
    async fn close(&self);
}

pub type SharedTrack = Arc<dyn TrackLocal + Send + Sync>;

/// `webrtc`-backed endpoint. One per remote peer.
pub struct RtcEndpoint {
    peer: Arc<RTCPeerConnection>,
    video_sender: AsyncRwLock<Option<Arc<RTCRtpSender>>>,
    camera_track: AsyncRwLock<Option<SharedTrack>>,
    screen_track: AsyncRwLock<Option<SharedTrack>>,
}

impl RtcEndpoint {
    pub async fn new(ice_servers: Vec<IceServer>) -> Result<Self, EndpointError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: ice_servers.into_iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_endpoint_error)?,
        );
        Ok(Self {
            peer,
            video_sender: AsyncRwLock::new(None),
            camera_track: AsyncRwLock::new(None),
            screen_track: AsyncRwLock::new(None),
        })
    }

    pub fn peer(&self) -> Arc<RTCPeerConnection> {
        self.peer.clone()
    }

    /// Attach the outgoing camera track (and, optionally, a prepared screen
    /// track for later swapping). Triggers the transport's renegotiation
    /// callback.
    pub async fn publish_video(
        &self,
        camera: SharedTrack,
        screen: Option<SharedTrack>,
    ) -> Result<(), EndpointError> {
        let sender = self
            .peer
            .add_track(camera.clone())
            .await
            .map_err(to_endpoint_error)?;
        *self.video_sender.write().await = Some(sender);
        *self.camera_track.write().await = Some(camera);
        *self.screen_track.write().await = screen;
        Ok(())
    }

    /// Register the renegotiation-needed trigger. The caller is expected to
    /// route this into `PeerSession::negotiation_needed`.
    pub fn on_negotiation_needed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.peer.on_negotiation_needed(Box::new(move || {
            let callback = callback.clone();
            Box::pin(async move {
                callback();
            })
        }));
    }

    /// Register the local candidate trickle. End-of-gathering (`None`) is
    /// not forwarded.
    pub fn on_ice_candidate<F>(&self, callback: F)
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.peer
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let callback = callback.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => callback(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(err) => {
                            debug!(error = %err, "skipping unserializable local candidate");
                        }
                    }
                })
            }));
    }
}

#[async_trait]
impl SessionEndpoint for RtcEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, EndpointError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(to_endpoint_error)?;
        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(to_endpoint_error)?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EndpointError> {
        self.peer
            .set_local_description(to_rtc_description(&desc)?)
            .await
            .map_err(to_endpoint_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EndpointError> {
        self.peer
            .set_remote_description(to_rtc_description(&desc)?)
            .await
            .map_err(to_endpoint_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(to_endpoint_error)
    }

    async fn replace_video_track(&self, source: TrackSource) -> Result<(), EndpointError> {
        let sender = self
            .video_sender
            .read()
            .await
            .clone()
            .ok_or(EndpointError::NoVideoSender)?;
        let track = match source {
            TrackSource::Camera => self.camera_track.read().await.clone(),
            TrackSource::Screen => self.screen_track.read().await.clone(),
        }
        .ok_or(EndpointError::NoVideoSender)?;
        sender
            .replace_track(Some(track))
            .await
            .map_err(to_endpoint_error)
    }

    async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}

fn to_rtc_ice_server(server: IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls,
        username: server.username.unwrap_or_default(),
        credential: server.credential.unwrap_or_default(),
        ..Default::default()
    }
}

fn from_rtc_description(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, EndpointError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(to_endpoint_error)
}

fn to_endpoint_error(err: webrtc::Error) -> EndpointError {
    EndpointError::Transport(err.to_string())
}
