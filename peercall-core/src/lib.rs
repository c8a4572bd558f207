//! Peercall - one-to-one audio/video calling over a shared document store
//!
//! Two clients exchange a session record (offer, answer, caller and callee
//! identities) and two append-only candidate partitions through an observable
//! document store, then connect peer to peer. It features:
//!
//! - **Store-based signaling**: any Firestore-style backend implementing
//!   [`DocumentStore`]; an in-process [`MemoryStore`] is included
//! - **Single-writer call state**: one driver task per client, generation
//!   tagged inputs, and idempotent teardown
//! - **Early candidate buffering**: remote candidates are queued until the
//!   remote description is applied, then released once each, in order
//! - **Pluggable transport and capture**: WebRTC via `webrtc-rs`, or the
//!   in-process [`LoopbackTransport`] and [`SimulatedCamera`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = CallService::builder()
//!     .with_identity(Arc::new(StaticIdentity(Identity::new("a1", "Alice"))))
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_transport(Arc::new(LoopbackTransport::new()))
//!     .with_capture(Arc::new(SimulatedCamera::new()))
//!     .start()
//!     .await?;
//!
//! let mut events = service.subscribe_events();
//! service
//!     .controller()
//!     .initiate(Identity::new("b1", "Bob"), CallMode::Video)
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// User identities and peer directory
pub mod identity;

/// Client configuration
pub mod config;

/// Observable document store abstraction
pub mod store;

/// In-process document store
pub mod memory_store;

/// Session and candidate exchange over the store
pub mod signaling;

/// Remote candidate buffering
pub mod candidate_buffer;

/// Connection negotiation seam
pub mod negotiator;

/// WebRTC transport (requires webrtc-transport feature)
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

/// In-process transport and capture
pub mod loopback;

/// Local media capture and controls
pub mod media;

/// Session teardown
pub mod teardown;

/// Call state machine
pub mod call;

/// Call service orchestration
pub mod service;

// Re-export main types at crate root
pub use call::{CallController, CallError, CallSessionManager, CallSnapshot};
pub use candidate_buffer::{BufferDecision, CandidateBuffer};
pub use config::{CallConfig, ConfigError, SignalingConfig};
pub use identity::{
    CallTarget, Identity, IdentityError, IdentityProvider, PeerDirectory, PeerId, StaticDirectory,
    StaticIdentity,
};
pub use loopback::{LoopbackNegotiator, LoopbackTransport, SimulatedCamera};
pub use media::{
    CameraFacing, CameraSwitch, CaptureDevice, LocalMediaController, LocalTrack, MediaError,
    MediaSnapshot,
};
pub use memory_store::MemoryStore;
pub use negotiator::{
    ConnectionNegotiator, NegotiationError, NegotiatorEvent, NegotiatorEventSink, NegotiatorFactory,
};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{SessionChange, SessionPatch, SessionRecord, SignalingChannel, SignalingError};
pub use store::{
    ChangeKind, ChangeStream, DocumentChange, DocumentStore, DocumentStream, StoreError,
};
pub use teardown::{TeardownCoordinator, TeardownGuard, TeardownOutcome, TeardownReport};
pub use types::*;
#[cfg(feature = "webrtc-transport")]
pub use webrtc_transport::{WebRtcNegotiator, WebRtcTransport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallController, CallError, CallSnapshot};
    pub use crate::config::CallConfig;
    pub use crate::identity::{CallTarget, Identity, PeerId, StaticDirectory, StaticIdentity};
    pub use crate::loopback::{LoopbackTransport, SimulatedCamera};
    pub use crate::media::{CameraFacing, CameraSwitch};
    pub use crate::memory_store::MemoryStore;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::types::{CallEvent, CallMode, CallState, EndReason, SessionId};
    #[cfg(feature = "webrtc-transport")]
    pub use crate::webrtc_transport::WebRtcTransport;
}
