//! In-process transport and capture
//!
//! [`LoopbackTransport`] creates [`LoopbackNegotiator`]s that behave like a
//! peer connection on a perfect network: descriptions are minimal SDP, two
//! host candidates are gathered once the local description is set, and the
//! connection reports `Connected` as soon as both descriptions are applied.
//! [`SimulatedCamera`] hands out synthetic tracks and can be told to fail.
//! Together they let two clients complete a call over a shared store without
//! any network or devices.

use crate::media::{CameraFacing, CaptureDevice, LocalTrack, MediaError};
use crate::negotiator::{
    ConnectionNegotiator, NegotiationError, NegotiatorEvent, NegotiatorEventSink, NegotiatorFactory,
};
use crate::types::{
    ConnectionState, IceCandidateRecord, RemoteStream, SdpKind, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Host candidates gathered per negotiator
pub const LOOPBACK_CANDIDATES: u16 = 2;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn validate_sdp(desc: &SessionDescription) -> Result<(), NegotiationError> {
    if desc.sdp.trim().is_empty() {
        return Err(NegotiationError::MalformedDescription(
            "empty description".to_string(),
        ));
    }
    if !desc.sdp.starts_with("v=0") {
        return Err(NegotiationError::MalformedDescription(
            "missing version line".to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct LoopbackInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: HashMap<TrackKind, String>,
    applied: Vec<IceCandidateRecord>,
    connected: bool,
    closed: bool,
}

/// Simulated peer connection
pub struct LoopbackNegotiator {
    connection_id: u64,
    sink: Option<NegotiatorEventSink>,
    inner: Mutex<LoopbackInner>,
    fail_replace: AtomicBool,
    close_calls: AtomicUsize,
}

impl LoopbackNegotiator {
    /// Create a negotiator reporting to `sink`
    pub fn new(sink: NegotiatorEventSink) -> Self {
        Self::build(Some(sink))
    }

    /// Create a negotiator whose events go nowhere
    pub fn detached() -> Self {
        Self::build(None)
    }

    fn build(sink: Option<NegotiatorEventSink>) -> Self {
        Self {
            connection_id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            sink,
            inner: Mutex::new(LoopbackInner::default()),
            fail_replace: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    fn emit(&self, events: Vec<NegotiatorEvent>) {
        if let Some(sink) = &self.sink {
            for event in events {
                sink(event);
            }
        }
    }

    fn render_sdp(&self, senders: &HashMap<TrackKind, String>) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.connection_id
        );
        let mut mid = 0;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if senders.contains_key(&kind) {
                let media = match kind {
                    TrackKind::Audio => "m=audio 9 UDP/TLS/RTP/SAVPF 111",
                    TrackKind::Video => "m=video 9 UDP/TLS/RTP/SAVPF 96",
                };
                sdp.push_str(&format!("{media}\r\na=mid:{mid}\r\n"));
                mid += 1;
            }
        }
        sdp
    }

    /// Push a connection state as if the transport reported it
    pub fn inject_state(&self, state: ConnectionState) {
        self.emit(vec![NegotiatorEvent::ConnectionState(state)]);
    }

    /// Make subsequent `replace_track` calls fail
    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidateRecord> {
        self.inner.lock().applied.clone()
    }

    /// Id of the track currently attached to the `kind` sender
    pub fn sender_track(&self, kind: TrackKind) -> Option<String> {
        self.inner.lock().senders.get(&kind).cloned()
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of `close` calls
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn connect_if_ready(inner: &mut LoopbackInner, events: &mut Vec<NegotiatorEvent>) {
        if inner.local.is_some() && inner.remote.is_some() && !inner.connected {
            inner.connected = true;
            events.push(NegotiatorEvent::ConnectionState(ConnectionState::Connecting));
            events.push(NegotiatorEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl ConnectionNegotiator for LoopbackNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        Ok(SessionDescription::offer(self.render_sdp(&inner.senders)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        match &inner.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {
                Ok(SessionDescription::answer(self.render_sdp(&inner.senders)))
            }
            _ => Err(NegotiationError::RemoteDescriptionMissing),
        }
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        validate_sdp(&desc)?;
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(NegotiationError::Closed);
            }
            inner.local = Some(desc);
            for n in 1..=LOOPBACK_CANDIDATES {
                let port = 50_000 + (self.connection_id as u16 % 1_000) * 10 + n;
                events.push(NegotiatorEvent::LocalCandidate(
                    IceCandidateRecord::new(format!(
                        "candidate:{n} 1 udp 2122260223 127.0.0.1 {port} typ host"
                    ))
                    .with_media("0", 0),
                ));
            }
            Self::connect_if_ready(&mut inner, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        validate_sdp(&desc)?;
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(NegotiationError::Closed);
            }
            let expected = match &inner.local {
                Some(local) if local.kind == SdpKind::Offer => SdpKind::Answer,
                _ => SdpKind::Offer,
            };
            if desc.kind != expected {
                return Err(NegotiationError::UnexpectedDescription {
                    expected,
                    got: desc.kind,
                });
            }
            for (index, line) in desc.sdp.lines().filter(|l| l.starts_with("m=")).enumerate() {
                let kind = if line.starts_with("m=video") {
                    TrackKind::Video
                } else {
                    TrackKind::Audio
                };
                events.push(NegotiatorEvent::RemoteTrack(RemoteStream {
                    id: format!("remote-{}-{index}", self.connection_id),
                    kind,
                }));
            }
            inner.remote = Some(desc);
            Self::connect_if_ready(&mut inner, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateRecord,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        if inner.remote.is_none() {
            return Err(NegotiationError::RemoteDescriptionMissing);
        }
        inner.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        inner.senders.insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: &LocalTrack,
    ) -> Result<(), NegotiationError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(NegotiationError::Transport(
                "replace_track rejected".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        let sender = inner
            .senders
            .get_mut(&kind)
            .ok_or(NegotiationError::NoSender(kind))?;
        *sender = track.id().to_string();
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// Factory for [`LoopbackNegotiator`]s
///
/// Keeps every negotiator it created so tests can drive and inspect them.
#[derive(Default)]
pub struct LoopbackTransport {
    created: Mutex<Vec<Arc<LoopbackNegotiator>>>,
}

impl LoopbackTransport {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every negotiator created so far
    pub fn negotiators(&self) -> Vec<Arc<LoopbackNegotiator>> {
        self.created.lock().clone()
    }

    /// Most recently created negotiator
    pub fn last(&self) -> Option<Arc<LoopbackNegotiator>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl NegotiatorFactory for LoopbackTransport {
    async fn create(
        &self,
        ice_servers: &[String],
        sink: NegotiatorEventSink,
    ) -> Result<Arc<dyn ConnectionNegotiator>, NegotiationError> {
        let negotiator = Arc::new(LoopbackNegotiator::new(sink));
        tracing::debug!(
            connection_id = negotiator.connection_id,
            ice_servers = ice_servers.len(),
            "Loopback negotiator created"
        );
        self.created.lock().push(negotiator.clone());
        Ok(negotiator)
    }
}

/// Synthetic capture device
pub struct SimulatedCamera {
    label: String,
    next_track: AtomicUsize,
    deny_audio: AtomicBool,
    deny_video: AtomicBool,
    failing_facing: Mutex<Option<CameraFacing>>,
    captured: Mutex<Vec<LocalTrack>>,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    /// Create a device whose track ids start with `sim`
    #[must_use]
    pub fn new() -> Self {
        Self::labeled("sim")
    }

    /// Create a device whose track ids start with `label`
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_track: AtomicUsize::new(1),
            deny_audio: AtomicBool::new(false),
            deny_video: AtomicBool::new(false),
            failing_facing: Mutex::new(None),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Refuse microphone capture
    pub fn deny_audio(&self, deny: bool) {
        self.deny_audio.store(deny, Ordering::SeqCst);
    }

    /// Refuse camera capture
    pub fn deny_video(&self, deny: bool) {
        self.deny_video.store(deny, Ordering::SeqCst);
    }

    /// Make capture with this facing fail as unavailable
    pub fn fail_facing(&self, facing: Option<CameraFacing>) {
        *self.failing_facing.lock() = facing;
    }

    /// Every track handed out
    pub fn captured(&self) -> Vec<LocalTrack> {
        self.captured.lock().clone()
    }

    /// Tracks still capturing
    pub fn live_tracks(&self) -> usize {
        self.captured.lock().iter().filter(|t| t.is_live()).count()
    }

    fn start(&self, kind: TrackKind, facing: Option<CameraFacing>) -> LocalTrack {
        let n = self.next_track.fetch_add(1, Ordering::Relaxed);
        let kind_label = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let track = LocalTrack::new(format!("{}-{kind_label}-{n}", self.label), kind, facing);
        self.captured.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl CaptureDevice for SimulatedCamera {
    async fn capture_audio(&self) -> Result<LocalTrack, MediaError> {
        if self.deny_audio.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone".to_string()));
        }
        Ok(self.start(TrackKind::Audio, None))
    }

    async fn capture_video(&self, facing: CameraFacing) -> Result<LocalTrack, MediaError> {
        if self.deny_video.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera".to_string()));
        }
        if *self.failing_facing.lock() == Some(facing) {
            return Err(MediaError::DeviceUnavailable(format!("{facing:?} camera")));
        }
        Ok(self.start(TrackKind::Video, Some(facing)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recording() -> (NegotiatorEventSink, Arc<Mutex<Vec<NegotiatorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: NegotiatorEventSink = Arc::new(move |e| sink_events.lock().push(e));
        (sink, events)
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both() {
        let (sink_a, events_a) = recording();
        let (sink_b, events_b) = recording();
        let a = LoopbackNegotiator::new(sink_a);
        let b = LoopbackNegotiator::new(sink_b);
        a.add_track(&LocalTrack::new("a-audio", TrackKind::Audio, None))
            .await
            .unwrap();
        b.add_track(&LocalTrack::new("b-audio", TrackKind::Audio, None))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.starts_with("v=0"));
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        for events in [events_a, events_b] {
            let events = events.lock();
            let candidates = events
                .iter()
                .filter(|e| matches!(e, NegotiatorEvent::LocalCandidate(_)))
                .count();
            assert_eq!(candidates, usize::from(LOOPBACK_CANDIDATES));
            assert!(events.iter().any(|e| matches!(
                e,
                NegotiatorEvent::RemoteTrack(RemoteStream { kind: TrackKind::Audio, .. })
            )));
            assert_eq!(
                events.last(),
                Some(&NegotiatorEvent::ConnectionState(ConnectionState::Connected))
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_malformed_and_wrong_kind() {
        let n = LoopbackNegotiator::detached();
        assert!(matches!(
            n.set_remote_description(SessionDescription::offer("garbage")).await,
            Err(NegotiationError::MalformedDescription(_))
        ));
        assert!(matches!(
            n.set_remote_description(SessionDescription::answer("v=0\r\n")).await,
            Err(NegotiationError::UnexpectedDescription { .. })
        ));
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let n = LoopbackNegotiator::detached();
        let c = IceCandidateRecord::new("candidate:1");
        assert!(matches!(
            n.add_ice_candidate(c.clone()).await,
            Err(NegotiationError::RemoteDescriptionMissing)
        ));
        n.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        n.add_ice_candidate(c.clone()).await.unwrap();
        assert_eq!(n.applied_candidates(), vec![c]);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let n = LoopbackNegotiator::detached();
        n.close().await.unwrap();
        n.close().await.unwrap();
        assert!(n.is_closed());
        assert_eq!(n.close_calls(), 2);
        assert!(matches!(n.create_offer().await, Err(NegotiationError::Closed)));
    }

    #[tokio::test]
    async fn test_replace_track_needs_sender() {
        let n = LoopbackNegotiator::detached();
        let video = LocalTrack::new("v2", TrackKind::Video, Some(CameraFacing::Back));
        assert!(matches!(
            n.replace_track(TrackKind::Video, &video).await,
            Err(NegotiationError::NoSender(TrackKind::Video))
        ));
    }

    #[tokio::test]
    async fn test_simulated_camera_failures() {
        let camera = SimulatedCamera::labeled("cam");
        let audio = camera.capture_audio().await.unwrap();
        assert_eq!(audio.id(), "cam-audio-1");
        camera.fail_facing(Some(CameraFacing::Back));
        assert!(camera.capture_video(CameraFacing::Front).await.is_ok());
        assert!(matches!(
            camera.capture_video(CameraFacing::Back).await,
            Err(MediaError::DeviceUnavailable(_))
        ));
        camera.deny_audio(true);
        assert!(matches!(
            camera.capture_audio().await,
            Err(MediaError::PermissionDenied(_))
        ));
        assert_eq!(camera.live_tracks(), 2);
    }
}
