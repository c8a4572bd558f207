//! Peer identity and the collaborators that supply it
//!
//! The call core never authenticates anyone or renders a user list. It only
//! needs the local user's stable identity (from an [`IdentityProvider`]) and a
//! way to pick who a call is addressed to (a [`PeerDirectory`] feeding a
//! [`CallTarget`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use thiserror::Error;

/// Avatar reference used when the account has no photo
pub const DEFAULT_AVATAR: &str = "https://via.placeholder.com/40";

/// Identity collaborator errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// No user is signed in
    #[error("No signed-in user")]
    SignedOut,

    /// Peer lookup failed
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Directory backend failure
    #[error("Directory error: {0}")]
    Directory(String),
}

/// Stable user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A participant as shown to the other side of a call
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable id
    pub id: PeerId,
    /// Human readable name
    pub display_name: String,
    /// Avatar image reference
    pub avatar_ref: String,
}

impl Identity {
    /// Create an identity with the placeholder avatar
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: DEFAULT_AVATAR.to_string(),
        }
    }

    /// Replace the avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = avatar_ref.into();
        self
    }

    /// Build an identity from account fields
    ///
    /// A missing display name falls back to the local part of the email
    /// address, and a missing photo to [`DEFAULT_AVATAR`].
    pub fn from_account(
        uid: impl Into<PeerId>,
        display_name: Option<&str>,
        email: &str,
        photo: Option<&str>,
    ) -> Self {
        let name = match display_name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => email.split('@').next().unwrap_or_default().to_string(),
        };
        Self {
            id: uid.into(),
            display_name: name,
            avatar_ref: photo
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_AVATAR)
                .to_string(),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Who an outgoing call is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// One selected peer; only that peer will answer
    Peer(Identity),
    /// No addressee; any reachable client other than the caller may answer
    AnyPeer,
}

impl CallTarget {
    /// The addressed identity, if any
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Peer(identity) => Some(identity),
            Self::AnyPeer => None,
        }
    }
}

impl From<Identity> for CallTarget {
    fn from(identity: Identity) -> Self {
        Self::Peer(identity)
    }
}

/// Resolves the signed-in user
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The local user's identity
    async fn local_identity(&self) -> Result<Identity, IdentityError>;
}

/// Lists peers a call may be addressed to
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// All reachable peers, excluding the local user
    async fn reachable_peers(&self) -> Result<Vec<Identity>, IdentityError>;

    /// Resolve one peer by id
    async fn select(&self, id: &PeerId) -> Result<Identity, IdentityError> {
        self.reachable_peers()
            .await?
            .into_iter()
            .find(|peer| &peer.id == id)
            .ok_or_else(|| IdentityError::PeerNotFound(id.to_string()))
    }
}

/// Fixed identity, for embedding and tests
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Identity);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn local_identity(&self) -> Result<Identity, IdentityError> {
        Ok(self.0.clone())
    }
}

/// Fixed peer list seen from one user's point of view
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    local: PeerId,
    peers: Vec<Identity>,
}

impl StaticDirectory {
    /// Create a directory of `peers` as seen by `local`
    pub fn new(local: PeerId, peers: Vec<Identity>) -> Self {
        Self { local, peers }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn reachable_peers(&self) -> Result<Vec<Identity>, IdentityError> {
        Ok(self
            .peers
            .iter()
            .filter(|peer| peer.id != self.local)
            .cloned()
            .collect())
    }
}
