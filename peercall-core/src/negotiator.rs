//! Connection negotiation seam
//!
//! The call manager drives a peer connection through [`ConnectionNegotiator`]
//! and receives its asynchronous output (gathered candidates, remote tracks,
//! connection state) as [`NegotiatorEvent`]s pushed into a sink. Concrete
//! transports implement [`NegotiatorFactory`].

use crate::media::LocalTrack;
use crate::types::{ConnectionState, IceCandidateRecord, RemoteStream, SdpKind, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Negotiation errors
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    /// Description text could not be parsed
    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    /// Description of the wrong kind
    #[error("Expected {expected:?} description, got {got:?}")]
    UnexpectedDescription {
        /// Kind required in this position
        expected: SdpKind,
        /// Kind received
        got: SdpKind,
    },

    /// Candidate applied before any remote description
    #[error("Remote description not set")]
    RemoteDescriptionMissing,

    /// No outgoing sender carries this kind of track
    #[error("No sender for {0:?} track")]
    NoSender(TrackKind),

    /// No outgoing track has this id
    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Output of a negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Locally gathered candidate to publish
    LocalCandidate(IceCandidateRecord),
    /// Remote media arrived
    RemoteTrack(RemoteStream),
    /// Connection state changed
    ConnectionState(ConnectionState),
}

/// Receiver of negotiator output
pub type NegotiatorEventSink = Arc<dyn Fn(NegotiatorEvent) + Send + Sync>;

/// One peer connection
#[async_trait]
pub trait ConnectionNegotiator: Send + Sync {
    /// Produce an offer for the attached tracks
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply our own description; candidate gathering starts here
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    /// Apply the peer's description
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateRecord)
        -> Result<(), NegotiationError>;

    /// Attach an outgoing track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Swap the outgoing track of `kind` without renegotiation
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: &LocalTrack,
    ) -> Result<(), NegotiationError>;

    /// Close the connection; idempotent
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates negotiators
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Create a connection using `ice_servers`, reporting events to `sink`
    async fn create(
        &self,
        ice_servers: &[String],
        sink: NegotiatorEventSink,
    ) -> Result<Arc<dyn ConnectionNegotiator>, NegotiationError>;
}

/// Check a description received from the peer before applying it
///
/// # Errors
///
/// Returns error if the description is of the wrong kind or empty
pub fn validate_description(
    desc: &SessionDescription,
    expected: SdpKind,
) -> Result<(), NegotiationError> {
    if desc.kind != expected {
        return Err(NegotiationError::UnexpectedDescription {
            expected,
            got: desc.kind,
        });
    }
    if desc.sdp.trim().is_empty() {
        return Err(NegotiationError::MalformedDescription(
            "empty description".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_description() {
        assert!(validate_description(&SessionDescription::offer("v=0\r\n"), SdpKind::Offer).is_ok());
        assert!(matches!(
            validate_description(&SessionDescription::answer("v=0\r\n"), SdpKind::Offer),
            Err(NegotiationError::UnexpectedDescription {
                expected: SdpKind::Offer,
                got: SdpKind::Answer
            })
        ));
        assert!(matches!(
            validate_description(&SessionDescription::answer("  "), SdpKind::Answer),
            Err(NegotiationError::MalformedDescription(_))
        ));
    }
}
