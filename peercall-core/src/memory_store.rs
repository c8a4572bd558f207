//! In-process document store
//!
//! Every mutation and every subscription happens under one lock, so a watcher
//! registered at any point sees a consistent snapshot followed by every later
//! write, in order, with nothing lost or repeated.

use crate::store::{ChangeKind, ChangeStream, DocumentChange, DocumentStore, DocumentStream, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    /// Documents per collection in insertion order
    collections: HashMap<String, Vec<(String, Value)>>,
    doc_watchers: HashMap<(String, String), Vec<mpsc::UnboundedSender<Option<Value>>>>,
    collection_watchers: HashMap<String, Vec<mpsc::UnboundedSender<DocumentChange>>>,
}

impl StoreState {
    fn notify(&mut self, collection: &str, id: &str, kind: ChangeKind, value: &Value) {
        let key = (collection.to_string(), id.to_string());
        if let Some(watchers) = self.doc_watchers.get_mut(&key) {
            let doc = match kind {
                ChangeKind::Removed => None,
                _ => Some(value.clone()),
            };
            watchers.retain(|tx| tx.send(doc.clone()).is_ok());
            if watchers.is_empty() {
                self.doc_watchers.remove(&key);
            }
        }
        if let Some(watchers) = self.collection_watchers.get_mut(collection) {
            let change = DocumentChange {
                id: id.to_string(),
                kind,
                value: value.clone(),
                existing: false,
            };
            watchers.retain(|tx| tx.send(change.clone()).is_ok());
            if watchers.is_empty() {
                self.collection_watchers.remove(collection);
            }
        }
    }

    /// Drop watchers whose receivers are gone, and keys left without any
    fn prune_closed(&mut self) {
        self.doc_watchers.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
        self.collection_watchers.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
    }

    fn document_mut(&mut self, collection: &str, id: &str) -> Result<&mut Value, StoreError> {
        self.collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|(doc_id, _)| doc_id == id))
            .map(|(_, value)| value)
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{id}")))
    }

    fn apply_merge(&mut self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError> {
        let doc = self.document_mut(collection, id)?;
        match (doc.as_object_mut(), partial) {
            (Some(fields), Value::Object(updates)) => {
                for (key, value) in updates {
                    fields.insert(key, value);
                }
            }
            (_, replacement) => *doc = replacement,
        }
        let merged = doc.clone();
        self.notify(collection, id, ChangeKind::Modified, &merged);
        Ok(())
    }
}

/// Document store kept in memory
///
/// Writes can be made to fail with [`MemoryStore::set_unavailable`] to
/// exercise signaling failure paths.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Read one document
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        let state = self.state.lock();
        state
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|(doc_id, _)| doc_id == id))
            .map(|(_, value)| value.clone())
    }

    /// Read all documents of a collection in insertion order
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<(String, Value)> {
        let state = self.state.lock();
        state.collections.get(collection).cloned().unwrap_or_default()
    }

    /// Total documents across all collections
    #[must_use]
    pub fn total_documents(&self) -> usize {
        let state = self.state.lock();
        state.collections.values().map(Vec::len).sum()
    }

    /// Registered watchers across documents and collections
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let state = self.state.lock();
        state.doc_watchers.values().map(Vec::len).sum::<usize>()
            + state.collection_watchers.values().map(Vec::len).sum::<usize>()
    }

    /// Documents and collections that still have watcher entries
    #[must_use]
    pub fn watched_keys(&self) -> usize {
        let state = self.state.lock();
        state.doc_watchers.len() + state.collection_watchers.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn add(&self, collection: &str, value: Value) -> Result<String, StoreError> {
        self.check_available()?;
        let id = Uuid::new_v4().simple().to_string();
        let mut state = self.state.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), value.clone()));
        state.notify(collection, &id, ChangeKind::Added, &value);
        tracing::trace!(collection, id = %id, "Document added");
        Ok(id)
    }

    async fn merge(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().apply_merge(collection, id, partial)
    }

    async fn merge_if_absent(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        partial: Value,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let present = state
            .document_mut(collection, id)?
            .get(field)
            .is_some_and(|value| !value.is_null());
        if present {
            tracing::debug!(collection, id, field, "Conditional merge skipped");
            return Ok(false);
        }
        state.apply_merge(collection, id, partial)?;
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let removed = state.collections.get_mut(collection).and_then(|docs| {
            docs.iter()
                .position(|(doc_id, _)| doc_id == id)
                .map(|pos| docs.remove(pos))
        });
        if let Some((_, value)) = removed {
            state.notify(collection, id, ChangeKind::Removed, &value);
        }
        state
            .doc_watchers
            .remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let docs = state.collections.remove(collection).unwrap_or_default();
        for (id, value) in &docs {
            state.notify(collection, id, ChangeKind::Removed, value);
            state
                .doc_watchers
                .remove(&(collection.to_string(), id.clone()));
        }
        // Ends live watches of the partition
        state.collection_watchers.remove(collection);
        Ok(())
    }

    async fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<DocumentStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let current = state
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|(doc_id, _)| doc_id == id))
            .map(|(_, value)| value.clone());
        // The receiver is still held here, so this send cannot fail.
        let _ = tx.send(current);
        state.prune_closed();
        state
            .doc_watchers
            .entry((collection.to_string(), id.to_string()))
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn watch_collection(&self, collection: &str) -> Result<ChangeStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if let Some(docs) = state.collections.get(collection) {
            for (id, value) in docs {
                let _ = tx.send(DocumentChange {
                    id: id.clone(),
                    kind: ChangeKind::Added,
                    value: value.clone(),
                    existing: true,
                });
            }
        }
        state.prune_closed();
        state
            .collection_watchers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_get_merge_delete() {
        let store = MemoryStore::new();
        let id = store.add("calls", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("calls", &id), Some(json!({"a": 1})));

        store.merge("calls", &id, json!({"b": 2})).await.unwrap();
        assert_eq!(store.get("calls", &id), Some(json!({"a": 1, "b": 2})));

        store.delete("calls", &id).await.unwrap();
        assert_eq!(store.get("calls", &id), None);

        // Deleting again is fine
        store.delete("calls", &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_missing_document() {
        let store = MemoryStore::new();
        let res = store.merge("calls", "nope", json!({"b": 2})).await;
        assert!(matches!(res, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_watch_document_current_then_updates() {
        let store = MemoryStore::new();
        let id = store.add("calls", json!({"v": 0})).await.unwrap();
        let mut watch = store.watch_document("calls", &id).await.unwrap();

        store.merge("calls", &id, json!({"v": 1})).await.unwrap();
        store.merge("calls", &id, json!({"v": 2})).await.unwrap();
        store.delete("calls", &id).await.unwrap();

        assert_eq!(watch.next().await, Some(Some(json!({"v": 0}))));
        assert_eq!(watch.next().await, Some(Some(json!({"v": 1}))));
        assert_eq!(watch.next().await, Some(Some(json!({"v": 2}))));
        assert_eq!(watch.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_watch_collection_snapshot_then_live() {
        let store = MemoryStore::new();
        let first = store.add("c", json!(1)).await.unwrap();
        let mut watch = store.watch_collection("c").await.unwrap();
        let second = store.add("c", json!(2)).await.unwrap();

        let a = watch.next().await.unwrap();
        assert_eq!((a.id.as_str(), a.kind, a.existing), (first.as_str(), ChangeKind::Added, true));
        let b = watch.next().await.unwrap();
        assert_eq!((b.id.as_str(), b.kind, b.existing), (second.as_str(), ChangeKind::Added, false));
    }

    #[tokio::test]
    async fn test_clear_notifies_removals() {
        let store = MemoryStore::new();
        store.add("c", json!(1)).await.unwrap();
        store.add("c", json!(2)).await.unwrap();
        let mut watch = store.watch_collection("c").await.unwrap();
        store.clear("c").await.unwrap();

        let kinds: Vec<_> = watch.by_ref().take(4).map(|c| c.kind).collect().await;
        assert_eq!(
            kinds,
            vec![ChangeKind::Added, ChangeKind::Added, ChangeKind::Removed, ChangeKind::Removed]
        );
        assert!(store.documents("c").is_empty());
    }

    #[tokio::test]
    async fn test_merge_if_absent_first_writer_wins() {
        let store = MemoryStore::new();
        let id = store.add("calls", json!({"offer": 1, "answer": null})).await.unwrap();

        assert!(store
            .merge_if_absent("calls", &id, "answer", json!({"answer": "b", "calleeId": "b1"}))
            .await
            .unwrap());
        assert!(!store
            .merge_if_absent("calls", &id, "answer", json!({"answer": "c", "calleeId": "c1"}))
            .await
            .unwrap());
        assert_eq!(
            store.get("calls", &id),
            Some(json!({"offer": 1, "answer": "b", "calleeId": "b1"}))
        );
        assert!(matches!(
            store.merge_if_absent("calls", "nope", "answer", json!({})).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_clear_drop_watchers() {
        let store = MemoryStore::new();
        let id = store.add("calls", json!({"v": 0})).await.unwrap();
        store.add("calls/x/callerCandidates", json!(1)).await.unwrap();
        let mut doc = store.watch_document("calls", &id).await.unwrap();
        let mut partition = store.watch_collection("calls/x/callerCandidates").await.unwrap();
        assert_eq!(store.watched_keys(), 2);

        store.delete("calls", &id).await.unwrap();
        store.clear("calls/x/callerCandidates").await.unwrap();
        assert_eq!(store.watched_keys(), 0);

        // Pending changes are delivered, then the streams end
        assert_eq!(doc.next().await, Some(Some(json!({"v": 0}))));
        assert_eq!(doc.next().await, Some(None));
        assert_eq!(doc.next().await, None);
        assert_eq!(partition.by_ref().count().await, 2);
    }

    #[tokio::test]
    async fn test_dropped_watchers_are_pruned() {
        let store = MemoryStore::new();
        let id = store.add("calls", json!({"v": 0})).await.unwrap();
        drop(store.watch_document("calls", &id).await.unwrap());
        drop(store.watch_collection("calls").await.unwrap());

        store.merge("calls", &id, json!({"v": 1})).await.unwrap();
        assert_eq!(store.watched_keys(), 0);

        let _live = store.watch_collection("calls").await.unwrap();
        drop(store.watch_collection("calls").await.unwrap());
        drop(store.watch_collection("calls/x/callerCandidates").await.unwrap());
        let _again = store.watch_document("calls", &id).await.unwrap();
        assert_eq!(store.watcher_count(), 2);
        assert_eq!(store.watched_keys(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.add("c", json!(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.add("c", json!(1)).await.is_ok());
    }
}
