//! Shared document store abstraction
//!
//! The signaling channel persists session records and candidates in a
//! document store with observable collections (a Firestore-style backend).
//! Implement [`DocumentStore`] for your backend; [`crate::memory_store`]
//! provides an in-process implementation.
//!
//! Collections are addressed by slash-separated paths, so the candidate
//! partitions of session `abc` live at `calls/abc/callerCandidates` and
//! `calls/abc/calleeCandidates`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Backend could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Document does not exist
    #[error("Document not found: {0}")]
    NotFound(String),
}

/// How a document in a watched collection changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document created, or present when the watch began
    Added,
    /// Document fields changed
    Modified,
    /// Document deleted
    Removed,
}

/// One change in a watched collection
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Document id within the collection
    pub id: String,
    /// Change kind
    pub kind: ChangeKind,
    /// Document contents after the change (before it, for `Removed`)
    pub value: Value,
    /// Part of the snapshot delivered when the watch began
    pub existing: bool,
}

/// Updates of a single document; `None` means the document does not exist
pub type DocumentStream = BoxStream<'static, Option<Value>>;

/// Changes of a collection, in write order
pub type ChangeStream = BoxStream<'static, DocumentChange>;

/// Observable document store
///
/// Watch streams must deliver in write order. A document watch yields the
/// current value first; a collection watch yields every existing document as
/// `Added` with `existing = true` before any live change. A watch may end at
/// any time (the document or collection was deleted, or the backend dropped
/// the listener); callers re-subscribe.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document with a generated id
    async fn add(&self, collection: &str, value: Value) -> Result<String, StoreError>;

    /// Merge top-level fields of `partial` into an existing document
    async fn merge(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError>;

    /// Merge `partial` only while the document has no `field`
    ///
    /// The check and the write are atomic. Returns `false` without writing
    /// when `field` is already set.
    async fn merge_if_absent(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        partial: Value,
    ) -> Result<bool, StoreError>;

    /// Delete a document; deleting an absent document succeeds
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Delete every document of a collection
    async fn clear(&self, collection: &str) -> Result<(), StoreError>;

    /// Observe one document
    async fn watch_document(&self, collection: &str, id: &str)
        -> Result<DocumentStream, StoreError>;

    /// Observe a collection
    async fn watch_collection(&self, collection: &str) -> Result<ChangeStream, StoreError>;
}

/// Join path segments into a collection path
pub fn collection_path(segments: &[&str]) -> String {
    segments.join("/")
}
