//! WebRTC peer connection transport
//!
//! Implements the negotiation seam on top of `webrtc-rs`. Each outgoing
//! [`LocalTrack`] is paired with a `TrackLocalStaticSample`; the embedder
//! feeds encoded samples through [`WebRtcNegotiator::write_sample`], which
//! drops them while the track is muted, suspended or stopped.

use crate::media::LocalTrack;
use crate::negotiator::{
    ConnectionNegotiator, NegotiationError, NegotiatorEvent, NegotiatorEventSink, NegotiatorFactory,
};
use crate::types::{
    ConnectionState, IceCandidateRecord, RemoteStream, SdpKind, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "peercall";

fn transport_err(context: &str, e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Transport(format!("{context}: {e}"))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Factory for [`WebRtcNegotiator`]s
///
/// Clones share the handle to the most recently opened negotiator.
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransport {
    current: Arc<Mutex<Option<Weak<WebRtcNegotiator>>>>,
}

impl WebRtcTransport {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Negotiator of the ongoing call, for feeding local media
    pub fn current(&self) -> Option<Arc<WebRtcNegotiator>> {
        self.current.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Open a peer connection
    ///
    /// # Errors
    ///
    /// Returns error if the media engine or peer connection cannot be built
    #[tracing::instrument(skip(self, sink))]
    pub async fn open(
        &self,
        ice_servers: &[String],
        sink: NegotiatorEventSink,
    ) -> Result<Arc<WebRtcNegotiator>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_err("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| transport_err("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to create peer connection: {}", e);
                    transport_err("create peer connection", e)
                })?,
        );

        let candidate_sink = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink(NegotiatorEvent::LocalCandidate(IceCandidateRecord {
                        candidate_sdp: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Dropping unserializable local candidate"),
                }
            })
        }));

        let state_sink = sink.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                tracing::debug!(state = %state, "Peer connection state changed");
                if let Some(state) = map_state(state) {
                    state_sink(NegotiatorEvent::ConnectionState(state));
                }
                Box::pin(async {})
            },
        ));

        let track_sink = sink;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            track_sink(NegotiatorEvent::RemoteTrack(RemoteStream {
                id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        }));

        tracing::debug!("Created peer connection");
        let negotiator = Arc::new(WebRtcNegotiator {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            local_kind: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        *self.current.lock() = Some(Arc::downgrade(&negotiator));
        Ok(negotiator)
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcTransport {
    async fn create(
        &self,
        ice_servers: &[String],
        sink: NegotiatorEventSink,
    ) -> Result<Arc<dyn ConnectionNegotiator>, NegotiationError> {
        let negotiator: Arc<dyn ConnectionNegotiator> = self.open(ice_servers, sink).await?;
        Ok(negotiator)
    }
}

/// Local track and the sample sink transmitting it
struct OutgoingTrack {
    track: LocalTrack,
    sample: Arc<TrackLocalStaticSample>,
}

/// Peer connection backed by `webrtc-rs`
pub struct WebRtcNegotiator {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    outgoing: Mutex<HashMap<TrackKind, OutgoingTrack>>,
    local_kind: Mutex<Option<SdpKind>>,
    closed: AtomicBool,
}

impl WebRtcNegotiator {
    /// Send one encoded sample on the outgoing track with this id
    ///
    /// Returns `false` without sending while the track is disabled (muted or
    /// video suspended) or stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed, no outgoing track has this
    /// id, or the sample cannot be written
    pub async fn write_sample(
        &self,
        track_id: &str,
        sample: &Sample,
    ) -> Result<bool, NegotiationError> {
        self.ensure_open()?;
        let (track, sink) = self
            .outgoing
            .lock()
            .values()
            .find(|o| o.track.id() == track_id)
            .map(|o| (o.track.clone(), o.sample.clone()))
            .ok_or_else(|| NegotiationError::UnknownTrack(track_id.to_string()))?;
        if !track.is_enabled() || !track.is_live() {
            tracing::trace!(track_id, "Dropping sample for disabled track");
            return Ok(false);
        }
        sink.write_sample(sample)
            .await
            .map_err(|e| transport_err("write sample", e))?;
        Ok(true)
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn static_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ))
    }

    fn set_outgoing(&self, track: &LocalTrack, sample: Arc<TrackLocalStaticSample>) {
        self.outgoing.lock().insert(
            track.kind(),
            OutgoingTrack {
                track: track.clone(),
                sample,
            },
        );
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        if desc.sdp.trim().is_empty() {
            return Err(NegotiationError::MalformedDescription(
                "empty description".to_string(),
            ));
        }
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        parsed.map_err(|e| NegotiationError::MalformedDescription(e.to_string()))
    }
}

#[async_trait]
impl ConnectionNegotiator for WebRtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| transport_err("create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.peer_connection.remote_description().await.is_none() {
            return Err(NegotiationError::RemoteDescriptionMissing);
        }
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| transport_err("create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let kind = desc.kind;
        let rtc = Self::to_rtc(desc)?;
        self.peer_connection
            .set_local_description(rtc)
            .await
            .map_err(|e| transport_err("set local description", e))?;
        *self.local_kind.lock() = Some(kind);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let expected = match *self.local_kind.lock() {
            Some(SdpKind::Offer) => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(NegotiationError::UnexpectedDescription {
                expected,
                got: desc.kind,
            });
        }
        let rtc = Self::to_rtc(desc)?;
        self.peer_connection
            .set_remote_description(rtc)
            .await
            .map_err(|e| NegotiationError::MalformedDescription(e.to_string()))
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateRecord,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.peer_connection.remote_description().await.is_none() {
            return Err(NegotiationError::RemoteDescriptionMissing);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate_sdp,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| transport_err("add ICE candidate", e))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let sample = Self::static_track(track);
        let local: Arc<dyn TrackLocal + Send + Sync> = sample.clone();
        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|e| transport_err("add track", e))?;
        self.senders.lock().insert(track.kind(), sender);
        self.set_outgoing(track, sample);
        tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Track attached");
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: &LocalTrack,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(NegotiationError::NoSender(kind))?;
        let sample = Self::static_track(track);
        let local: Arc<dyn TrackLocal + Send + Sync> = sample.clone();
        sender
            .replace_track(Some(local))
            .await
            .map_err(|e| transport_err("replace track", e))?;
        // Replaces the previous track of this kind
        self.set_outgoing(track, sample);
        tracing::debug!(track_id = %track.id(), kind = ?kind, "Track replaced");
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.outgoing.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| transport_err("close", e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::CameraFacing;
    use std::time::Duration;

    fn sink() -> NegotiatorEventSink {
        Arc::new(|_| {})
    }

    async fn negotiator() -> Arc<dyn ConnectionNegotiator> {
        WebRtcTransport::new().create(&[], sink()).await.unwrap()
    }

    #[tokio::test]
    async fn test_offer_with_audio_track() {
        let n = negotiator().await;
        n.add_track(&LocalTrack::new("mic", TrackKind::Audio, None))
            .await
            .unwrap();
        let offer = n.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        assert!(offer.sdp.contains("m=audio"));
        n.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_remote_description() {
        let n = negotiator().await;
        let res = n
            .set_remote_description(SessionDescription::offer("garbage"))
            .await;
        assert!(matches!(res, Err(NegotiationError::MalformedDescription(_))));
        n.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description() {
        let n = negotiator().await;
        let res = n
            .add_ice_candidate(IceCandidateRecord::new(
                "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host",
            ))
            .await;
        assert!(matches!(res, Err(NegotiationError::RemoteDescriptionMissing)));
        n.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_without_sender() {
        let n = negotiator().await;
        let res = n
            .replace_track(TrackKind::Video, &LocalTrack::new("cam", TrackKind::Video, None))
            .await;
        assert!(matches!(res, Err(NegotiationError::NoSender(TrackKind::Video))));
        n.close().await.unwrap();
    }

    fn sample() -> Sample {
        Sample {
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_samples_dropped_while_disabled_or_stopped() {
        let transport = WebRtcTransport::new();
        let n = transport.open(&[], sink()).await.unwrap();
        assert!(Arc::ptr_eq(&transport.current().unwrap(), &n));

        let mic = LocalTrack::new("mic", TrackKind::Audio, None);
        n.add_track(&mic).await.unwrap();
        assert!(n.write_sample("mic", &sample()).await.unwrap());

        // Muting flips the flag shared with the attached track
        mic.clone().set_enabled(false);
        assert!(!n.write_sample("mic", &sample()).await.unwrap());
        mic.set_enabled(true);
        assert!(n.write_sample("mic", &sample()).await.unwrap());

        mic.stop();
        assert!(!n.write_sample("mic", &sample()).await.unwrap());

        assert!(matches!(
            n.write_sample("cam", &sample()).await,
            Err(NegotiationError::UnknownTrack(_))
        ));
        n.close().await.unwrap();
        assert!(matches!(
            n.write_sample("mic", &sample()).await,
            Err(NegotiationError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_replaced_track_no_longer_accepts_samples() {
        let n = WebRtcTransport::new().open(&[], sink()).await.unwrap();
        let front = LocalTrack::new("cam-front", TrackKind::Video, Some(CameraFacing::Front));
        let back = LocalTrack::new("cam-back", TrackKind::Video, Some(CameraFacing::Back));
        n.add_track(&front).await.unwrap();

        n.replace_track(TrackKind::Video, &back).await.unwrap();
        assert!(matches!(
            n.write_sample("cam-front", &sample()).await,
            Err(NegotiationError::UnknownTrack(_))
        ));
        assert!(n.write_sample("cam-back", &sample()).await.unwrap());
        n.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let n = negotiator().await;
        n.close().await.unwrap();
        n.close().await.unwrap();
        assert!(matches!(n.create_offer().await, Err(NegotiationError::Closed)));
    }
}
