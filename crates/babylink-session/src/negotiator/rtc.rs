//! [`PeerConnectionFactory`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use babylink_common::{Error, IceCandidate, Result, SdpType, SessionConfig, SessionDescription};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    MediaConstraints, MediaKind, MediaStream, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSender,
};

/// Builds `webrtc` peer connections with the configured ICE servers.
///
/// Tracks added with [`with_local_track`](Self::with_local_track) are
/// attached to every connection; a station uses this for its camera and
/// microphone, a parent typically adds none.
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl RtcPeerFactory {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(Error::negotiation)?;
        let api = APIBuilder::new().with_media_engine(media).build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
            local_tracks: Vec::new(),
        })
    }

    pub fn with_local_track(mut self, track: Arc<TrackLocalStaticSample>) -> Self {
        self.local_tracks.push(track);
        self
    }

    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.local_tracks
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn peer_connection(&self, events: PeerEventSender) -> Result<Box<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(Error::negotiation)?,
        );

        for track in &self.local_tracks {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(Error::negotiation)?;
            let _ = events.send(PeerEvent::LocalStreamAdded(MediaStream {
                stream_id: track.stream_id().to_string(),
                track_id: track.id().to_string(),
                kind: media_kind(track.kind()),
            }));
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
                }
            })
        }));

        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let stream = MediaStream {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind: media_kind(track.kind()),
                };
                info!(stream = %stream.stream_id, track = %stream.track_id, "remote track added");
                let _ = events.send(PeerEvent::RemoteStreamAdded(stream));
            })
        }));

        Ok(Box::new(RtcPeerConnection { pc }))
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription> {
        if !constraints.dtls_srtp_key_agreement {
            warn!("DTLS-SRTP cannot be disabled; ignoring constraint");
        }
        let kinds = [
            (constraints.receive_audio, RTPCodecType::Audio),
            (constraints.receive_video, RTPCodecType::Video),
        ];
        for (wanted, kind) in kinds {
            if !wanted {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(Error::negotiation)?;
        }

        let offer = self.pc.create_offer(None).await.map_err(Error::negotiation)?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(Error::negotiation)?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(Error::negotiation)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::negotiation)
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp;
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::PrAnswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = sdp;
            return Ok(rollback);
        }
    };
    converted.map_err(Error::negotiation)
}

fn from_rtc(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::PrAnswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}
