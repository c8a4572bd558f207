//! Call session management
//!
//! One driver task owns all mutable call state. Everything that can change
//! it arrives as a message: user commands from [`CallController`], newly
//! created session records, record changes, remote candidates, and
//! transport events. Messages produced on behalf of a session carry the
//! session's generation number; anything tagged with a generation other
//! than the current one is stale and dropped.
//!
//! # Call flow
//!
//! ```text
//!            initiate                       answer applied + Connected
//!   Idle ─────────────► OutgoingPending ───────────────────────────┐
//!    ▲                                                             ▼
//!    │   record observed          answer written              Connected
//!    ├──────────────────► IncomingPending ───────────────────────►  │
//!    │                                                              │
//!    │          end_call / record removed / transport failure       │
//!    └────────────────────────── Ending ◄───────────────────────────┘
//! ```

use crate::candidate_buffer::{BufferDecision, CandidateBuffer};
use crate::config::CallConfig;
use crate::identity::{CallTarget, Identity};
use crate::media::{CameraSwitch, CaptureDevice, LocalMediaController, LocalTrack, MediaError, MediaSnapshot};
use crate::negotiator::{
    validate_description, ConnectionNegotiator, NegotiationError, NegotiatorEvent,
    NegotiatorEventSink, NegotiatorFactory,
};
use crate::signaling::{SessionChange, SessionPatch, SignalingChannel, SignalingError};
use crate::teardown::{SignalingCleanup, TeardownCoordinator, TeardownGuard, TeardownOutcome};
use crate::types::{
    CallEvent, CallMode, CallRole, CallSession, CallState, ConnectionState, EndReason,
    IceCandidateRecord, SdpKind, SessionDescription, SessionId,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// Local capture could not start; nothing was persisted
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(MediaError),

    /// Descriptions could not be produced or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(NegotiationError),

    /// Transport reported a terminal state
    #[error("Transport failure: {0:?}")]
    TransportFailure(ConnectionState),

    /// Session record could not be written
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Media control failed
    #[error("Media error: {0}")]
    Media(MediaError),

    /// Operation not allowed in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(CallState),

    /// Driver task is gone
    #[error("Call manager stopped")]
    ManagerStopped,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingUnavailable(err.to_string())
    }
}

/// Read-only view of the call manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Current state
    pub state: CallState,
    /// Active session, once persisted
    pub session_id: Option<SessionId>,
    /// Our side of the active session
    pub role: Option<CallRole>,
    /// The other side, when known
    pub peer: Option<Identity>,
    /// Mode of the active session
    pub mode: Option<CallMode>,
    /// Local media
    pub media: Option<MediaSnapshot>,
    /// Remote description applied to the transport
    pub remote_description_applied: bool,
    /// Remote candidates waiting for the remote description
    pub pending_candidates: usize,
}

enum Command {
    Initiate {
        target: CallTarget,
        mode: CallMode,
        reply: oneshot::Sender<Result<SessionId, CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<Result<CameraSwitch, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum CallInput {
    IncomingSession(CallSession),
    SessionChanged { generation: u64, change: SessionChange },
    RemoteCandidate { generation: u64, candidate: IceCandidateRecord },
    Transport { generation: u64, event: NegotiatorEvent },
    /// A session watch ended and could not be re-established
    WatchLost { generation: u64, watch: &'static str },
    DiscoveryLost,
}

struct ActiveSession {
    generation: u64,
    role: CallRole,
    session_id: Option<SessionId>,
    peer: Option<Identity>,
    mode: CallMode,
    negotiator: Arc<dyn ConnectionNegotiator>,
    buffer: CandidateBuffer,
    /// This client may delete the whole record on teardown
    holds_record: bool,
    remote_applied: bool,
    guard: TeardownGuard,
    forwarders: Vec<JoinHandle<()>>,
}

/// Handle to a running call manager
///
/// Cheap to clone; every clone talks to the same driver task.
#[derive(Clone)]
pub struct CallController {
    local: Identity,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    state: watch::Receiver<CallState>,
}

impl CallController {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)
    }

    /// Identity this manager calls as
    pub fn local_identity(&self) -> &Identity {
        &self.local
    }

    /// Start an outgoing call
    ///
    /// # Errors
    ///
    /// Returns error if not idle, capture fails, or the offer cannot be
    /// created or persisted
    pub async fn initiate(
        &self,
        target: impl Into<CallTarget>,
        mode: CallMode,
    ) -> Result<SessionId, CallError> {
        let target = target.into();
        self.request(|reply| Command::Initiate {
            target,
            mode,
            reply,
        })
        .await?
    }

    /// Hang up; a no-op when idle
    ///
    /// # Errors
    ///
    /// Returns error if the manager has stopped
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await?
    }

    /// Flip the muted flag; returns the new value
    ///
    /// # Errors
    ///
    /// Returns error if no media is held
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    /// Flip the video-suspended flag; returns the new value
    ///
    /// # Errors
    ///
    /// Returns error if no video is held
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    /// Swap front and back cameras
    ///
    /// # Errors
    ///
    /// Returns error if there is no active session or the swap failed; the
    /// previous camera stays in use on failure
    pub async fn switch_camera(&self) -> Result<CameraSwitch, CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await?
    }

    /// Current manager state
    ///
    /// # Errors
    ///
    /// Returns error if the manager has stopped
    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Latest state
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// End any active session and stop the driver
    ///
    /// # Errors
    ///
    /// Returns error if the manager had already stopped
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Call state machine driver
pub struct CallSessionManager {
    local: Identity,
    config: CallConfig,
    signaling: Arc<SignalingChannel>,
    transport: Arc<dyn NegotiatorFactory>,
    media: LocalMediaController,
    teardown: TeardownCoordinator,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    inputs: mpsc::UnboundedSender<CallInput>,
    session: Option<ActiveSession>,
    next_generation: u64,
    incoming: Option<JoinHandle<()>>,
}

impl CallSessionManager {
    /// Subscribe to incoming sessions and spawn the driver task
    ///
    /// # Errors
    ///
    /// Returns error if the session collection cannot be watched
    #[tracing::instrument(skip_all, fields(local = %local.id))]
    pub async fn start(
        local: Identity,
        config: CallConfig,
        signaling: Arc<SignalingChannel>,
        transport: Arc<dyn NegotiatorFactory>,
        capture: Arc<dyn CaptureDevice>,
    ) -> Result<CallController, CallError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let incoming = signaling.watch_all_sessions().await?;
        let incoming = forward(
            incoming,
            inputs_tx.clone(),
            CallInput::IncomingSession,
            Some(CallInput::DiscoveryLost),
        );

        let manager = Self {
            local: local.clone(),
            teardown: TeardownCoordinator::new(signaling.clone()),
            media: LocalMediaController::new(capture),
            config,
            signaling,
            transport,
            state: CallState::Idle,
            state_tx,
            events: events.clone(),
            inputs: inputs_tx,
            session: None,
            next_generation: 1,
            incoming: Some(incoming),
        };
        tokio::spawn(manager.run(commands_rx, inputs_rx));
        tracing::info!("Call manager started");

        Ok(CallController {
            local,
            commands: commands_tx,
            events,
            state: state_rx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<CallInput>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
        }
        tracing::info!(local = %self.local.id, "Call manager stopped");
    }

    async fn stop(&mut self) {
        if let Some(incoming) = self.incoming.take() {
            incoming.abort();
        }
        self.finish(EndReason::Shutdown).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                target,
                mode,
                reply,
            } => {
                let result = self.initiate(target, mode).await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                if self.session.is_some() {
                    self.finish(EndReason::LocalHangup).await;
                }
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.media.toggle_mute().map_err(CallError::Media));
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.media.toggle_video().map_err(CallError::Media));
            }
            Command::SwitchCamera { reply } => {
                let result = match self.session.as_ref().map(|s| s.negotiator.clone()) {
                    Some(negotiator) => self
                        .media
                        .switch_camera(negotiator.as_ref())
                        .await
                        .map_err(CallError::Media),
                    None => Err(CallError::InvalidState(self.state)),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_input(&mut self, input: CallInput) {
        match input {
            CallInput::IncomingSession(session) => self.on_incoming(session).await,
            CallInput::SessionChanged { generation, change } => {
                self.on_session_changed(generation, change).await;
            }
            CallInput::RemoteCandidate {
                generation,
                candidate,
            } => self.on_remote_candidate(generation, candidate).await,
            CallInput::Transport { generation, event } => {
                self.on_transport(generation, event).await;
            }
            CallInput::WatchLost { generation, watch } => {
                if self.current(generation).is_some() {
                    let msg = format!("{watch} watch lost");
                    tracing::warn!(watch, "Session watch lost");
                    self.fail(
                        EndReason::SignalingFailed(msg.clone()),
                        CallError::SignalingUnavailable(msg),
                    )
                    .await;
                }
            }
            CallInput::DiscoveryLost => {
                tracing::error!("Incoming call discovery stopped");
                self.incoming = None;
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        let session = self.session.as_ref();
        CallSnapshot {
            state: self.state,
            session_id: session.and_then(|s| s.session_id.clone()),
            role: session.map(|s| s.role),
            peer: session.and_then(|s| s.peer.clone()),
            mode: session.map(|s| s.mode),
            media: self.media.snapshot(),
            remote_description_applied: session.is_some_and(|s| s.remote_applied),
            pending_candidates: session.map_or(0, |s| s.buffer.pending_len()),
        }
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Call state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(CallEvent::StateChanged { state });
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn event_sink(&self, generation: u64) -> NegotiatorEventSink {
        let inputs = self.inputs.clone();
        Arc::new(move |event| {
            let _ = inputs.send(CallInput::Transport { generation, event });
        })
    }

    fn current(&mut self, generation: u64) -> Option<&mut ActiveSession> {
        let active = self
            .session
            .as_mut()
            .filter(|s| s.generation == generation);
        if active.is_none() {
            tracing::trace!(generation, "Dropping stale input");
        }
        active
    }

    async fn open_negotiator(
        &mut self,
        generation: u64,
        tracks: &[LocalTrack],
    ) -> Result<Arc<dyn ConnectionNegotiator>, CallError> {
        let sink = self.event_sink(generation);
        let negotiator = match self.transport.create(&self.config.ice_servers, sink).await {
            Ok(negotiator) => negotiator,
            Err(e) => {
                self.media.release();
                return Err(CallError::Negotiation(e));
            }
        };
        for track in tracks {
            if let Err(e) = negotiator.add_track(track).await {
                self.abandon(negotiator, SignalingCleanup::None).await;
                return Err(CallError::Negotiation(e));
            }
        }
        Ok(negotiator)
    }

    /// Tear down a session that never became current
    async fn abandon(&mut self, negotiator: Arc<dyn ConnectionNegotiator>, cleanup: SignalingCleanup) {
        self.teardown
            .teardown(&TeardownGuard::new(), Some(negotiator), &mut self.media, cleanup)
            .await;
    }

    #[tracing::instrument(skip(self, target), fields(local = %self.local.id))]
    async fn initiate(&mut self, target: CallTarget, mode: CallMode) -> Result<SessionId, CallError> {
        if self.state != CallState::Idle {
            return Err(CallError::InvalidState(self.state));
        }

        let tracks = self
            .media
            .acquire(mode)
            .await
            .map_err(CallError::MediaAcquisition)?;

        let generation = self.allocate_generation();
        let negotiator = self.open_negotiator(generation, &tracks).await?;

        let offer = match create_local(negotiator.as_ref(), SdpKind::Offer).await {
            Ok(offer) => offer,
            Err(e) => {
                self.abandon(negotiator, SignalingCleanup::None).await;
                return Err(CallError::Negotiation(e));
            }
        };

        let peer = target.identity().cloned();
        let session = CallSession::new(self.local.clone(), peer.clone(), mode, offer);
        let session_id = match self.signaling.create_session(&session).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist offer");
                self.abandon(negotiator, SignalingCleanup::None).await;
                return Err(e.into());
            }
        };

        self.session = Some(ActiveSession {
            generation,
            role: CallRole::Caller,
            session_id: Some(session_id.clone()),
            peer: peer.clone(),
            mode,
            negotiator,
            buffer: CandidateBuffer::new(),
            holds_record: true,
            remote_applied: false,
            guard: TeardownGuard::new(),
            forwarders: Vec::new(),
        });
        self.set_state(CallState::OutgoingPending);
        if let Some(identity) = peer {
            self.emit(CallEvent::CallerInfo { identity, mode });
        }

        if let Err(e) = self.watch_session(generation, &session_id, CallRole::Caller).await {
            self.emit(CallEvent::CallFailed {
                error: e.to_string(),
            });
            self.finish(EndReason::SignalingFailed(e.to_string())).await;
            return Err(e);
        }

        tracing::info!(session_id = %session_id, mode = %mode, "Outgoing call placed");
        Ok(session_id)
    }

    /// Subscribe to the record and the inbound candidate partition
    async fn watch_session(
        &mut self,
        generation: u64,
        session_id: &SessionId,
        role: CallRole,
    ) -> Result<(), CallError> {
        let changes = self.signaling.watch_session(session_id).await?;
        let candidates = self
            .signaling
            .watch_candidates(session_id, role.inbound())
            .await?;

        let forwarders = vec![
            forward(
                changes,
                self.inputs.clone(),
                move |change| CallInput::SessionChanged { generation, change },
                Some(CallInput::WatchLost {
                    generation,
                    watch: "session",
                }),
            ),
            forward(
                candidates,
                self.inputs.clone(),
                move |candidate| CallInput::RemoteCandidate {
                    generation,
                    candidate,
                },
                Some(CallInput::WatchLost {
                    generation,
                    watch: "candidate",
                }),
            ),
        ];
        match self.current(generation) {
            Some(active) => active.forwarders.extend(forwarders),
            None => forwarders.iter().for_each(JoinHandle::abort),
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(local = %self.local.id, session_id = %session.session_id))]
    async fn on_incoming(&mut self, session: CallSession) {
        if session.caller.id == self.local.id {
            tracing::trace!("Ignoring own session");
            return;
        }
        if let Some(callee) = &session.callee {
            if callee.id != self.local.id {
                tracing::trace!(callee = %callee.id, "Ignoring session addressed elsewhere");
                return;
            }
        }
        if session.answer.is_some() {
            tracing::trace!("Ignoring already answered session");
            return;
        }
        if self.state != CallState::Idle {
            tracing::debug!(state = %self.state, "Busy, ignoring incoming session");
            return;
        }

        tracing::info!(caller = %session.caller, mode = %session.mode, "Incoming call");
        self.set_state(CallState::IncomingPending);
        self.emit(CallEvent::CallerInfo {
            identity: session.caller.clone(),
            mode: session.mode,
        });

        let tracks = match self.media.acquire(session.mode).await {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot answer: media unavailable");
                self.emit(CallEvent::CallFailed {
                    error: CallError::MediaAcquisition(e).to_string(),
                });
                self.set_state(CallState::Idle);
                return;
            }
        };

        let generation = self.allocate_generation();
        let negotiator = match self.open_negotiator(generation, &tracks).await {
            Ok(negotiator) => negotiator,
            Err(e) => {
                self.emit(CallEvent::CallFailed {
                    error: e.to_string(),
                });
                self.set_state(CallState::Idle);
                return;
            }
        };

        let session_id = session.session_id.clone();
        self.session = Some(ActiveSession {
            generation,
            role: CallRole::Callee,
            session_id: Some(session_id.clone()),
            peer: Some(session.caller.clone()),
            mode: session.mode,
            negotiator: negotiator.clone(),
            buffer: CandidateBuffer::new(),
            holds_record: false,
            remote_applied: false,
            guard: TeardownGuard::new(),
            forwarders: Vec::new(),
        });

        if let Err(e) = self.apply_remote(generation, session.offer).await {
            tracing::warn!(error = %e, "Remote offer rejected");
            self.fail(EndReason::NegotiationFailed(e.to_string()), CallError::Negotiation(e))
                .await;
            return;
        }

        let answer = match create_local(negotiator.as_ref(), SdpKind::Answer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(EndReason::NegotiationFailed(e.to_string()), CallError::Negotiation(e))
                    .await;
                return;
            }
        };

        let patch = SessionPatch::answer(answer).with_callee(&self.local);
        match self.signaling.answer_session(&session_id, &patch).await {
            Ok(()) => {}
            Err(SignalingError::AlreadyAnswered(_)) => {
                tracing::info!("Session answered by another client");
                self.finish(EndReason::AnsweredElsewhere).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist answer");
                self.fail(EndReason::SignalingFailed(e.to_string()), e.into())
                    .await;
                return;
            }
        }
        if let Some(active) = self.current(generation) {
            active.holds_record = true;
        }

        if let Err(e) = self.watch_session(generation, &session_id, CallRole::Callee).await {
            self.fail(EndReason::SignalingFailed(e.to_string()), e).await;
            return;
        }

        self.set_state(CallState::Connected);
        tracing::info!("Incoming call answered");
    }

    /// Apply the peer's description and release buffered candidates
    async fn apply_remote(
        &mut self,
        generation: u64,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(active) = self.current(generation) else {
            return Ok(());
        };
        let expected = match active.role {
            CallRole::Caller => SdpKind::Answer,
            CallRole::Callee => SdpKind::Offer,
        };
        validate_description(&desc, expected)?;
        active.negotiator.set_remote_description(desc).await?;
        active.remote_applied = true;

        let flushed = active.buffer.remote_description_set();
        if !flushed.is_empty() {
            tracing::debug!(count = flushed.len(), "Applying buffered candidates");
        }
        for candidate in flushed {
            if let Err(e) = active.negotiator.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply buffered candidate");
            }
        }
        Ok(())
    }

    async fn on_session_changed(&mut self, generation: u64, change: SessionChange) {
        let Some(active) = self.current(generation) else {
            return;
        };
        match change {
            SessionChange::Removed => {
                tracing::info!("Session record removed");
                active.holds_record = false;
                self.finish(EndReason::RemoteHangup).await;
            }
            SessionChange::Updated(session) => {
                if active.role != CallRole::Caller || active.remote_applied {
                    return;
                }
                let Some(answer) = session.answer else {
                    return;
                };
                let mode = active.mode;
                let mut learned = None;
                if active.peer.is_none() {
                    if let Some(callee) = session.callee {
                        active.peer = Some(callee.clone());
                        learned = Some(callee);
                    }
                }
                if let Some(identity) = learned {
                    self.emit(CallEvent::CallerInfo { identity, mode });
                }
                tracing::debug!("Answer received");
                if let Err(e) = self.apply_remote(generation, answer).await {
                    tracing::warn!(error = %e, "Answer rejected");
                    self.fail(EndReason::NegotiationFailed(e.to_string()), CallError::Negotiation(e))
                        .await;
                }
            }
        }
    }

    async fn on_remote_candidate(&mut self, generation: u64, candidate: IceCandidateRecord) {
        let Some(active) = self.current(generation) else {
            return;
        };
        match active.buffer.push(candidate) {
            BufferDecision::Apply(candidate) => {
                if let Err(e) = active.negotiator.add_ice_candidate(candidate).await {
                    tracing::warn!(error = %e, "Failed to apply remote candidate");
                }
            }
            BufferDecision::Queued => tracing::trace!("Remote candidate queued"),
            BufferDecision::Duplicate => tracing::debug!("Duplicate remote candidate ignored"),
            BufferDecision::Discarded => {}
        }
    }

    async fn on_transport(&mut self, generation: u64, event: NegotiatorEvent) {
        let Some(active) = self.current(generation) else {
            return;
        };
        match event {
            NegotiatorEvent::LocalCandidate(candidate) => {
                let Some(session_id) = active.session_id.clone() else {
                    return;
                };
                let direction = active.role.outbound();
                if let Err(e) = self
                    .signaling
                    .append_candidate(&session_id, direction, &candidate)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to publish local candidate");
                }
            }
            NegotiatorEvent::RemoteTrack(stream) => {
                tracing::debug!(stream_id = %stream.id, kind = ?stream.kind, "Remote track");
                self.emit(CallEvent::RemoteStream { stream });
            }
            NegotiatorEvent::ConnectionState(state) if state.is_terminal_failure() => {
                tracing::warn!(state = ?state, "Transport lost");
                self.fail(
                    EndReason::TransportFailure(state),
                    CallError::TransportFailure(state),
                )
                .await;
            }
            NegotiatorEvent::ConnectionState(ConnectionState::Connected) => {
                let ready = active.role == CallRole::Caller && active.remote_applied;
                if ready && self.state == CallState::OutgoingPending {
                    self.set_state(CallState::Connected);
                    tracing::info!("Outgoing call connected");
                }
            }
            NegotiatorEvent::ConnectionState(state) => {
                tracing::trace!(state = ?state, "Transport state");
            }
        }
    }

    async fn fail(&mut self, reason: EndReason, error: CallError) {
        self.emit(CallEvent::CallFailed {
            error: error.to_string(),
        });
        self.finish(reason).await;
    }

    /// End the current session, if any
    async fn finish(&mut self, reason: EndReason) {
        let Some(mut active) = self.session.take() else {
            return;
        };
        self.set_state(CallState::Ending);
        for forwarder in active.forwarders.drain(..) {
            forwarder.abort();
        }
        active.buffer.close();

        let cleanup = match (&active.session_id, active.holds_record) {
            (None, _) => SignalingCleanup::None,
            (Some(id), true) => SignalingCleanup::Session(id.clone()),
            (Some(id), false) => SignalingCleanup::Partition(id.clone(), active.role.outbound()),
        };
        let outcome = self
            .teardown
            .teardown(
                &active.guard,
                Some(active.negotiator.clone()),
                &mut self.media,
                cleanup,
            )
            .await;
        if let TeardownOutcome::Completed(report) = &outcome {
            if !report.errors.is_empty() {
                tracing::warn!(errors = ?report.errors, "Teardown finished with errors");
            }
        }

        self.set_state(CallState::Idle);
        tracing::info!(reason = ?reason, "Call ended");
        self.emit(CallEvent::CallEnded {
            session_id: active.session_id,
            reason,
        });
    }
}

async fn create_local(
    negotiator: &dyn ConnectionNegotiator,
    kind: SdpKind,
) -> Result<SessionDescription, NegotiationError> {
    let desc = match kind {
        SdpKind::Offer => negotiator.create_offer().await?,
        SdpKind::Answer => negotiator.create_answer().await?,
    };
    negotiator.set_local_description(desc.clone()).await?;
    Ok(desc)
}

/// Feed a watch into the driver; `on_end` is sent if the watch ends
fn forward<T: Send + 'static>(
    mut stream: BoxStream<'static, T>,
    inputs: mpsc::UnboundedSender<CallInput>,
    wrap: impl Fn(T) -> CallInput + Send + 'static,
    on_end: Option<CallInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            if inputs.send(wrap(item)).is_err() {
                return;
            }
        }
        if let Some(input) = on_end {
            let _ = inputs.send(input);
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::loopback::{LoopbackTransport, SimulatedCamera};
    use crate::memory_store::MemoryStore;

    async fn controller() -> CallController {
        let store = Arc::new(MemoryStore::new());
        let signaling = Arc::new(SignalingChannel::new(store, SignalingConfig::default()));
        CallSessionManager::start(
            Identity::new("a1", "Alice"),
            CallConfig::default(),
            signaling,
            Arc::new(LoopbackTransport::new()),
            Arc::new(SimulatedCamera::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_end_call_when_idle_is_noop() {
        let calls = controller().await;
        calls.end_call().await.unwrap();
        assert_eq!(calls.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_controls_without_media() {
        let calls = controller().await;
        assert!(matches!(
            calls.toggle_mute().await,
            Err(CallError::Media(MediaError::NotAcquired))
        ));
        assert!(matches!(
            calls.switch_camera().await,
            Err(CallError::InvalidState(CallState::Idle))
        ));
    }

    #[tokio::test]
    async fn test_initiate_twice_rejected() {
        let calls = controller().await;
        calls
            .initiate(Identity::new("b1", "Bob"), CallMode::Audio)
            .await
            .unwrap();
        assert!(matches!(
            calls.initiate(CallTarget::AnyPeer, CallMode::Audio).await,
            Err(CallError::InvalidState(CallState::OutgoingPending))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let calls = controller().await;
        calls.shutdown().await.unwrap();
        assert!(matches!(
            calls.snapshot().await,
            Err(CallError::ManagerStopped)
        ));
    }
}
