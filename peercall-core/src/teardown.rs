//! Session teardown
//!
//! Every path that ends a session (local hangup, remote removal, transport
//! failure, shutdown) funnels through [`TeardownCoordinator::teardown`]. Each
//! step is best-effort: a failing step is logged and the remaining steps
//! still run.

use crate::media::LocalMediaController;
use crate::negotiator::ConnectionNegotiator;
use crate::signaling::SignalingChannel;
use crate::types::{CandidateDirection, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot latch for a session's teardown
#[derive(Debug, Clone, Default)]
pub struct TeardownGuard(Arc<AtomicBool>);

impl TeardownGuard {
    /// Create an unused guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the teardown; only the first caller gets `true`
    pub fn try_enter(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Whether teardown has been claimed
    pub fn is_spent(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What to remove from the signaling store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCleanup {
    /// No record was ever written
    None,
    /// Delete the record and both candidate partitions
    Session(SessionId),
    /// Delete only our own outbound partition
    Partition(SessionId, CandidateDirection),
}

/// Steps that ran and which of them failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Transport was closed without error
    pub transport_closed: bool,
    /// Local tracks were held and have been stopped
    pub media_released: bool,
    /// Store cleanup succeeded (or nothing needed removing)
    pub signaling_cleaned: bool,
    /// Messages of failed steps
    pub errors: Vec<String>,
}

/// Result of a teardown request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Cleanup ran
    Completed(TeardownReport),
    /// Another path already tore this session down
    AlreadyTornDown,
}

/// Runs session cleanup
pub struct TeardownCoordinator {
    signaling: Arc<SignalingChannel>,
}

impl TeardownCoordinator {
    /// Create a coordinator over the signaling channel
    pub fn new(signaling: Arc<SignalingChannel>) -> Self {
        Self { signaling }
    }

    /// Close the transport, release media, and clean up the store
    #[tracing::instrument(skip(self, guard, negotiator, media))]
    pub async fn teardown(
        &self,
        guard: &TeardownGuard,
        negotiator: Option<Arc<dyn ConnectionNegotiator>>,
        media: &mut LocalMediaController,
        cleanup: SignalingCleanup,
    ) -> TeardownOutcome {
        if !guard.try_enter() {
            tracing::debug!("Teardown already performed");
            return TeardownOutcome::AlreadyTornDown;
        }

        let mut report = TeardownReport::default();

        if let Some(negotiator) = negotiator {
            match negotiator.close().await {
                Ok(()) => report.transport_closed = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to close transport");
                    report.errors.push(format!("transport: {e}"));
                }
            }
        }

        report.media_released = media.release();

        let cleaned = match &cleanup {
            SignalingCleanup::None => Ok(()),
            SignalingCleanup::Session(id) => self.signaling.delete_session(id).await,
            SignalingCleanup::Partition(id, direction) => {
                self.signaling.delete_candidates(id, *direction).await
            }
        };
        match cleaned {
            Ok(()) => report.signaling_cleaned = true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clean up signaling store");
                report.errors.push(format!("signaling: {e}"));
            }
        }

        tracing::info!(
            transport_closed = report.transport_closed,
            media_released = report.media_released,
            signaling_cleaned = report.signaling_cleaned,
            "Session torn down"
        );
        TeardownOutcome::Completed(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::identity::Identity;
    use crate::loopback::{LoopbackNegotiator, SimulatedCamera};
    use crate::memory_store::MemoryStore;
    use crate::types::{CallMode, CallSession, IceCandidateRecord, SessionDescription};

    fn setup() -> (Arc<MemoryStore>, Arc<SignalingChannel>, TeardownCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let config = SignalingConfig {
            retry_backoff_ms: 1,
            ..SignalingConfig::default()
        };
        let signaling = Arc::new(SignalingChannel::new(store.clone(), config));
        (store, signaling.clone(), TeardownCoordinator::new(signaling))
    }

    async fn seeded(signaling: &SignalingChannel) -> SessionId {
        let session = CallSession::new(
            Identity::new("a1", "Alice"),
            None,
            CallMode::Audio,
            SessionDescription::offer("v=0\r\n"),
        );
        let id = signaling.create_session(&session).await.unwrap();
        for direction in [
            CandidateDirection::CallerToCallee,
            CandidateDirection::CalleeToCaller,
        ] {
            signaling
                .append_candidate(&id, direction, &IceCandidateRecord::new("candidate:1"))
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let (store, signaling, coordinator) = setup();
        let id = seeded(&signaling).await;
        let camera = Arc::new(SimulatedCamera::new());
        let mut media = LocalMediaController::new(camera.clone());
        media.acquire(CallMode::Audio).await.unwrap();
        let negotiator = Arc::new(LoopbackNegotiator::detached());
        let guard = TeardownGuard::new();

        let first = coordinator
            .teardown(
                &guard,
                Some(negotiator.clone()),
                &mut media,
                SignalingCleanup::Session(id.clone()),
            )
            .await;
        let TeardownOutcome::Completed(report) = first else {
            panic!("first teardown must run");
        };
        assert!(report.transport_closed && report.media_released && report.signaling_cleaned);
        assert_eq!(store.total_documents(), 0);
        assert_eq!(camera.live_tracks(), 0);

        let second = coordinator
            .teardown(
                &guard,
                Some(negotiator.clone()),
                &mut media,
                SignalingCleanup::Session(id),
            )
            .await;
        assert_eq!(second, TeardownOutcome::AlreadyTornDown);
        assert_eq!(negotiator.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_partition_cleanup_keeps_record() {
        let (store, signaling, coordinator) = setup();
        let id = seeded(&signaling).await;
        let camera = Arc::new(SimulatedCamera::new());
        let mut media = LocalMediaController::new(camera);

        coordinator
            .teardown(
                &TeardownGuard::new(),
                None,
                &mut media,
                SignalingCleanup::Partition(id.clone(), CandidateDirection::CalleeToCaller),
            )
            .await;

        assert!(store.get("calls", id.as_str()).is_some());
        assert!(store
            .documents(&format!("calls/{id}/calleeCandidates"))
            .is_empty());
        assert_eq!(
            store
                .documents(&format!("calls/{id}/callerCandidates"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_failing_store_does_not_stop_other_steps() {
        let (store, signaling, coordinator) = setup();
        let id = seeded(&signaling).await;
        store.set_unavailable(true);
        let camera = Arc::new(SimulatedCamera::new());
        let mut media = LocalMediaController::new(camera.clone());
        media.acquire(CallMode::Video).await.unwrap();
        let negotiator = Arc::new(LoopbackNegotiator::detached());

        let outcome = coordinator
            .teardown(
                &TeardownGuard::new(),
                Some(negotiator.clone()),
                &mut media,
                SignalingCleanup::Session(id),
            )
            .await;
        let TeardownOutcome::Completed(report) = outcome else {
            panic!("teardown must run");
        };
        assert!(report.transport_closed);
        assert!(report.media_released);
        assert!(!report.signaling_cleaned);
        assert_eq!(report.errors.len(), 1);
        assert!(negotiator.is_closed());
        assert_eq!(camera.live_tracks(), 0);
    }
}
