//! Call session types and data structures

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a session record in the signaling store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new random session id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Call media mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallMode {
    /// Whether video is captured in this mode
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for CallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call mode: {other}")),
        }
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// Offer/answer negotiation payload
///
/// The SDP is opaque to the coordinator; it is moved between the transport
/// and the signaling store unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP blob
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    /// Candidate line
    #[serde(rename = "candidateSdp")]
    pub candidate_sdp: String,
    /// SDP media id
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidateRecord {
    /// Candidate with only the candidate line set
    pub fn new(candidate_sdp: impl Into<String>) -> Self {
        Self {
            candidate_sdp: candidate_sdp.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Set the media id and line index
    #[must_use]
    pub fn with_media(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }

    /// Identity used for de-duplication: candidate line, media id and line index
    pub fn dedup_key(&self) -> (String, Option<String>, Option<u16>) {
        (
            self.candidate_sdp.clone(),
            self.sdp_mid.clone(),
            self.sdp_mline_index,
        )
    }
}

/// Candidate partition of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateDirection {
    /// Written by the caller, read by the callee
    CallerToCallee,
    /// Written by the callee, read by the caller
    CalleeToCaller,
}

impl CandidateDirection {
    /// Name of the partition in the store
    pub fn partition(self) -> &'static str {
        match self {
            Self::CallerToCallee => "callerCandidates",
            Self::CalleeToCaller => "calleeCandidates",
        }
    }

    /// The partition the other side writes
    pub fn opposite(self) -> Self {
        match self {
            Self::CallerToCallee => Self::CalleeToCaller,
            Self::CalleeToCaller => Self::CallerToCallee,
        }
    }
}

/// Which side of a session this client is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Created the session record
    Caller,
    /// Answered an observed session
    Callee,
}

impl CallRole {
    /// The candidate partition this side writes
    pub fn outbound(self) -> CandidateDirection {
        match self {
            Self::Caller => CandidateDirection::CallerToCallee,
            Self::Callee => CandidateDirection::CalleeToCaller,
        }
    }

    /// The candidate partition this side reads
    pub fn inbound(self) -> CandidateDirection {
        self.outbound().opposite()
    }
}

/// One call's negotiation state as shared through signaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Record id
    pub session_id: SessionId,
    /// Who started the call
    pub caller: Identity,
    /// Addressee, unset for calls open to any peer
    pub callee: Option<Identity>,
    /// Media mode
    pub mode: CallMode,
    /// Caller's offer
    pub offer: SessionDescription,
    /// Callee's answer once written
    pub answer: Option<SessionDescription>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// New unanswered session; the id is assigned when the record is created
    pub fn new(
        caller: Identity,
        callee: Option<Identity>,
        mode: CallMode,
        offer: SessionDescription,
    ) -> Self {
        Self {
            session_id: SessionId(String::new()),
            caller,
            callee,
            mode,
            offer,
            answer: None,
            created_at: Utc::now(),
        }
    }
}

/// Call manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No session
    Idle,
    /// Offer persisted, awaiting answer
    OutgoingPending,
    /// Remote offer observed, answering
    IncomingPending,
    /// Media is flowing
    Connected,
    /// Teardown in progress
    Ending,
}

impl CallState {
    /// Whether a session is pending or active
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::OutgoingPending => "outgoing-pending",
            Self::IncomingPending => "incoming-pending",
            Self::Connected => "connected",
            Self::Ending => "ending",
        };
        f.write_str(s)
    }
}

/// Transport connection state as reported by the native capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Path lost
    Disconnected,
    /// Path could not be established or recovered
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// Whether this state ends the session
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

/// Remote media made available by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Media kind of the arriving track
    pub kind: TrackKind,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// The other side removed the session
    RemoteHangup,
    /// Transport reported `disconnected` or `failed`
    TransportFailure(ConnectionState),
    /// Description could not be applied
    NegotiationFailed(String),
    /// Session record could not be written or observed
    SignalingFailed(String),
    /// Another client answered the session first
    AnsweredElsewhere,
    /// Local client shut down
    Shutdown,
}

/// Events for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// State machine moved
    StateChanged {
        /// New state
        state: CallState,
    },
    /// Remote media arrived
    RemoteStream {
        /// The stream
        stream: RemoteStream,
    },
    /// Who is on the other side
    CallerInfo {
        /// Peer identity
        identity: Identity,
        /// Call mode
        mode: CallMode,
    },
    /// A user-visible failure
    CallFailed {
        /// Error description
        error: String,
    },
    /// Session ended and cleanup ran
    CallEnded {
        /// Session that ended
        session_id: Option<SessionId>,
        /// Why it ended
        reason: EndReason,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_mode_parse() {
        assert_eq!("audio".parse::<CallMode>().unwrap(), CallMode::Audio);
        assert_eq!("VIDEO".parse::<CallMode>().unwrap(), CallMode::Video);
        assert!("screen".parse::<CallMode>().is_err());
        assert!(CallMode::Video.has_video());
        assert!(!CallMode::Audio.has_video());
    }

    #[test]
    fn test_candidate_wire_names() {
        let c = IceCandidateRecord::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host")
            .with_media("0", 0);
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("candidateSdp").is_some());
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_some());
    }

    #[test]
    fn test_role_partitions() {
        assert_eq!(
            CallRole::Caller.outbound().partition(),
            "callerCandidates"
        );
        assert_eq!(CallRole::Caller.inbound().partition(), "calleeCandidates");
        assert_eq!(CallRole::Callee.outbound(), CandidateDirection::CalleeToCaller);
        assert_eq!(CallRole::Callee.inbound(), CandidateDirection::CallerToCallee);
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(ConnectionState::Failed.is_terminal_failure());
        assert!(ConnectionState::Disconnected.is_terminal_failure());
        assert!(!ConnectionState::Closed.is_terminal_failure());
        assert!(!ConnectionState::Connected.is_terminal_failure());
    }

    #[test]
    fn test_sdp_kind_serialization() {
        let offer = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["kind"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }
}
