//! Call signaling over a shared document store
//!
//! Session records and ICE candidates are exchanged through a
//! [`DocumentStore`]. This module owns the wire shape of both and the retry
//! policy for store operations.
//!
//! Only idempotent operations (subscriptions, deletes) are retried; a failed
//! create or update is reported to the caller, which aborts the call attempt.
//! Watches survive the store ending a listener: the channel re-subscribes
//! with backoff and filters out what it already delivered.

use crate::config::SignalingConfig;
use crate::identity::{Identity, PeerId};
use crate::store::{
    collection_path, ChangeKind, ChangeStream, DocumentChange, DocumentStore, DocumentStream,
    StoreError,
};
use crate::types::{
    CallMode, CallSession, CandidateDirection, IceCandidateRecord, SessionDescription, SessionId,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Store read/write failed
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Record could not be encoded or decoded
    #[error("Invalid session record: {0}")]
    InvalidRecord(String),

    /// Another callee answered first
    #[error("Session already answered: {0}")]
    AlreadyAnswered(String),
}

impl From<StoreError> for SignalingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            StoreError::NotFound(msg) => Self::SessionNotFound(msg),
        }
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRecord(err.to_string())
    }
}

/// Session record as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Caller's offer
    pub offer: SessionDescription,
    /// Callee's answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Caller id
    pub caller_id: String,
    /// Caller display name
    pub caller_name: String,
    /// Caller avatar reference
    pub caller_avatar: String,
    /// Callee id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<String>,
    /// Callee display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_name: Option<String>,
    /// Callee avatar reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_avatar: Option<String>,
    /// Media mode
    pub mode: CallMode,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Attach an id to produce the domain session
    pub fn into_session(self, session_id: SessionId) -> CallSession {
        let callee = self.callee_id.map(|id| Identity {
            id: PeerId(id),
            display_name: self.callee_name.unwrap_or_default(),
            avatar_ref: self.callee_avatar.unwrap_or_default(),
        });
        CallSession {
            session_id,
            caller: Identity {
                id: PeerId(self.caller_id),
                display_name: self.caller_name,
                avatar_ref: self.caller_avatar,
            },
            callee,
            mode: self.mode,
            offer: self.offer,
            answer: self.answer,
            created_at: self.created_at,
        }
    }
}

impl From<&CallSession> for SessionRecord {
    fn from(session: &CallSession) -> Self {
        Self {
            offer: session.offer.clone(),
            answer: session.answer.clone(),
            caller_id: session.caller.id.to_string(),
            caller_name: session.caller.display_name.clone(),
            caller_avatar: session.caller.avatar_ref.clone(),
            callee_id: session.callee.as_ref().map(|c| c.id.to_string()),
            callee_name: session.callee.as_ref().map(|c| c.display_name.clone()),
            callee_avatar: session.callee.as_ref().map(|c| c.avatar_ref.clone()),
            mode: session.mode,
            created_at: session.created_at,
        }
    }
}

/// Partial update of a session record
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    /// Answer to attach
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Answering user's id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<String>,
    /// Answering user's display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callee_name: Option<String>,
    /// Answering user's avatar reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callee_avatar: Option<String>,
}

impl SessionPatch {
    /// Patch that sets the answer
    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            ..Self::default()
        }
    }

    /// Also record who answered
    #[must_use]
    pub fn with_callee(mut self, callee: &Identity) -> Self {
        self.callee_id = Some(callee.id.to_string());
        self.callee_name = Some(callee.display_name.clone());
        self.callee_avatar = Some(callee.avatar_ref.clone());
        self
    }
}

/// Observed change of one session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// Current contents
    Updated(CallSession),
    /// Record no longer exists
    Removed,
}

/// Session/candidate exchange over a document store
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    config: SignalingConfig,
}

impl SignalingChannel {
    /// Create a channel over `store`
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: SignalingConfig) -> Self {
        Self { store, config }
    }

    /// Access the underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn sessions(&self) -> &str {
        &self.config.sessions_collection
    }

    fn partition(&self, session_id: &SessionId, direction: CandidateDirection) -> String {
        collection_path(&[self.sessions(), session_id.as_str(), direction.partition()])
    }

    /// Persist a new session record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written; not retried
    #[tracing::instrument(skip(self, session), fields(caller = %session.caller.id, mode = %session.mode))]
    pub async fn create_session(&self, session: &CallSession) -> Result<SessionId, SignalingError> {
        let value = serde_json::to_value(SessionRecord::from(session))?;
        let id = self.store.add(self.sessions(), value).await?;
        tracing::debug!(session_id = %id, "Session record created");
        Ok(SessionId(id))
    }

    /// Apply a partial update to a session record
    ///
    /// # Errors
    ///
    /// Returns error if the record is absent or cannot be written; not retried
    #[tracing::instrument(skip(self, patch), fields(session_id = %session_id))]
    pub async fn update_session(
        &self,
        session_id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<(), SignalingError> {
        let value = serde_json::to_value(patch)?;
        self.store
            .merge(self.sessions(), session_id.as_str(), value)
            .await?;
        tracing::debug!("Session record updated");
        Ok(())
    }

    /// Delete a session record and both candidate partitions
    ///
    /// Deleting an already deleted session succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the store stays unavailable after retries
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), SignalingError> {
        self.delete_candidates(session_id, CandidateDirection::CallerToCallee)
            .await?;
        self.delete_candidates(session_id, CandidateDirection::CalleeToCaller)
            .await?;
        let sessions = self.sessions().to_string();
        self.retry("delete_session", || {
            self.store.delete(&sessions, session_id.as_str())
        })
        .await?;
        tracing::debug!("Session record deleted");
        Ok(())
    }

    /// Delete one candidate partition
    ///
    /// # Errors
    ///
    /// Returns error if the store stays unavailable after retries
    pub async fn delete_candidates(
        &self,
        session_id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<(), SignalingError> {
        let path = self.partition(session_id, direction);
        self.retry("delete_candidates", || self.store.clear(&path))
            .await
    }

    /// Append a candidate to a partition
    ///
    /// # Errors
    ///
    /// Returns error if the candidate cannot be written
    #[tracing::instrument(skip(self, candidate), fields(session_id = %session_id, direction = ?direction))]
    pub async fn append_candidate(
        &self,
        session_id: &SessionId,
        direction: CandidateDirection,
        candidate: &IceCandidateRecord,
    ) -> Result<(), SignalingError> {
        let value = serde_json::to_value(candidate)?;
        self.store
            .add(&self.partition(session_id, direction), value)
            .await?;
        tracing::trace!("Candidate appended");
        Ok(())
    }

    /// Write the callee's answer unless the session was already answered
    ///
    /// The first answer written wins; a later answer is rejected with
    /// [`SignalingError::AlreadyAnswered`] and leaves the record untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the session is absent, already answered, or cannot be
    /// written; not retried
    #[tracing::instrument(skip(self, patch), fields(session_id = %session_id))]
    pub async fn answer_session(
        &self,
        session_id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<(), SignalingError> {
        let value = serde_json::to_value(patch)?;
        let written = self
            .store
            .merge_if_absent(self.sessions(), session_id.as_str(), "answer", value)
            .await?;
        if !written {
            tracing::debug!("Session already answered");
            return Err(SignalingError::AlreadyAnswered(session_id.to_string()));
        }
        tracing::debug!("Answer written");
        Ok(())
    }

    /// Observe a session record
    ///
    /// Yields the current value first and every later change in write order.
    /// Records that fail to decode are skipped. When the store ends the watch
    /// the channel re-subscribes and yields the current value again; the
    /// stream ends after [`SessionChange::Removed`] or once re-subscribing
    /// fails after retries.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established after retries
    pub async fn watch_session(
        &self,
        session_id: &SessionId,
    ) -> Result<BoxStream<'static, SessionChange>, SignalingError> {
        let sessions = self.sessions().to_string();
        let id = session_id.clone();
        let open = move |store: Arc<dyn DocumentStore>| -> WatchFuture<DocumentStream> {
            let sessions = sessions.clone();
            let id = id.clone();
            Box::pin(async move { store.watch_document(&sessions, id.as_str()).await })
        };
        let id = session_id.clone();
        let decode = move |doc: Option<serde_json::Value>, _resumed: bool| match doc {
            None => Decoded::Last(SessionChange::Removed),
            Some(value) => match decode_session(&id, value) {
                Some(session) => Decoded::Item(SessionChange::Updated(session)),
                None => Decoded::Skip,
            },
        };
        self.resubscribing("watch_session", open, decode).await
    }

    /// Observe a candidate partition
    ///
    /// Every candidate is delivered exactly once in append order, including
    /// candidates appended before the watch began and across re-subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established after retries
    pub async fn watch_candidates(
        &self,
        session_id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<BoxStream<'static, IceCandidateRecord>, SignalingError> {
        let path = self.partition(session_id, direction);
        let open = move |store: Arc<dyn DocumentStore>| -> WatchFuture<ChangeStream> {
            let path = path.clone();
            Box::pin(async move { store.watch_collection(&path).await })
        };
        let mut delivered = HashSet::new();
        self.resubscribing("watch_candidates", open, move |change: DocumentChange, _resumed| {
            if change.kind != ChangeKind::Added || !delivered.insert(change.id) {
                return Decoded::Skip;
            }
            match serde_json::from_value(change.value) {
                Ok(candidate) => Decoded::Item(candidate),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable candidate");
                    Decoded::Skip
                }
            }
        })
        .await
    }

    /// Observe every newly created session record
    ///
    /// Records already present when the watch begins are not delivered.
    /// Records created while the channel was re-subscribing are.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established after retries
    pub async fn watch_all_sessions(
        &self,
    ) -> Result<BoxStream<'static, CallSession>, SignalingError> {
        let sessions = self.sessions().to_string();
        let open = move |store: Arc<dyn DocumentStore>| -> WatchFuture<ChangeStream> {
            let sessions = sessions.clone();
            Box::pin(async move { store.watch_collection(&sessions).await })
        };
        let since = Utc::now();
        let mut known = HashSet::new();
        self.resubscribing("watch_all_sessions", open, move |change: DocumentChange, resumed| {
            if change.kind != ChangeKind::Added || !known.insert(change.id.clone()) {
                return Decoded::Skip;
            }
            if change.existing && !resumed {
                return Decoded::Skip;
            }
            match decode_session(&SessionId(change.id), change.value) {
                // Existing records seen after a re-subscribe may predate the watch
                Some(session) if change.existing && session.created_at < since => Decoded::Skip,
                Some(session) => Decoded::Item(session),
                None => Decoded::Skip,
            }
        })
        .await
    }

    /// Subscribe with retries and keep re-subscribing whenever the store
    /// ends the watch
    async fn resubscribing<T, U, O, D>(
        &self,
        op: &'static str,
        open: O,
        decode: D,
    ) -> Result<BoxStream<'static, U>, SignalingError>
    where
        T: Send + 'static,
        U: Send + 'static,
        O: Fn(Arc<dyn DocumentStore>) -> WatchFuture<BoxStream<'static, T>>
            + Send
            + Sync
            + 'static,
        D: FnMut(T, bool) -> Decoded<U> + Send + 'static,
    {
        let stream = with_retry(&self.config, op, || open(self.store.clone())).await?;
        let watch = Watch {
            op,
            store: self.store.clone(),
            config: self.config.clone(),
            stream,
            resumed: false,
            open,
            decode,
        };
        Ok(futures::stream::unfold(Some(watch), |watch| async move {
            let mut watch = watch?;
            watch.next().await.map(|(item, last)| {
                let rest = if last { None } else { Some(watch) };
                (item, rest)
            })
        })
        .boxed())
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, SignalingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.config, op, f).await
    }
}

type WatchFuture<S> = BoxFuture<'static, Result<S, StoreError>>;

/// Outcome of decoding one raw watch item
enum Decoded<U> {
    Item(U),
    /// Final item; the watch ends after it
    Last(U),
    Skip,
}

struct Watch<T, O, D> {
    op: &'static str,
    store: Arc<dyn DocumentStore>,
    config: SignalingConfig,
    stream: BoxStream<'static, T>,
    /// Current subscription replaced one the store ended
    resumed: bool,
    open: O,
    decode: D,
}

impl<T, U, O, D> Watch<T, O, D>
where
    O: Fn(Arc<dyn DocumentStore>) -> WatchFuture<BoxStream<'static, T>>,
    D: FnMut(T, bool) -> Decoded<U>,
{
    /// Next decoded item and whether it is the last one
    async fn next(&mut self) -> Option<(U, bool)> {
        loop {
            match self.stream.next().await {
                Some(raw) => match (self.decode)(raw, self.resumed) {
                    Decoded::Item(item) => return Some((item, false)),
                    Decoded::Last(item) => return Some((item, true)),
                    Decoded::Skip => {}
                },
                None => {
                    tracing::warn!(op = self.op, "Watch ended by store, re-subscribing");
                    sleep(self.config.backoff(1)).await;
                    let store = self.store.clone();
                    let open = &self.open;
                    match with_retry(&self.config, self.op, || open(store.clone())).await {
                        Ok(stream) => {
                            self.stream = stream;
                            self.resumed = true;
                        }
                        Err(e) => {
                            tracing::error!(op = self.op, error = %e, "Watch lost");
                            return None;
                        }
                    }
                }
            }
        }
    }
}

async fn with_retry<T, F, Fut>(
    config: &SignalingConfig,
    op: &'static str,
    mut f: F,
) -> Result<T, SignalingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = config.retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Unavailable(msg)) if attempt < attempts => {
                let backoff = config.backoff(attempt);
                tracing::warn!(
                    op,
                    attempt,
                    backoff_ms = backoff.as_millis(),
                    error = %msg,
                    "Store unavailable, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn decode_session(id: &SessionId, value: serde_json::Value) -> Option<CallSession> {
    match serde_json::from_value::<SessionRecord>(value) {
        Ok(record) => Some(record.into_session(id.clone())),
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "Skipping undecodable session record");
            None
        }
    }
}
