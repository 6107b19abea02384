use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    DocumentStore, FindOptions, PartialSelect, doc_not_found, ensure_object, merge_shallow,
    paginate, sort_docs,
};
use crate::{
    Error, Result,
    filter::Filter,
    metrics,
    persistence::{Mirror, Persistence},
};

type Collection = BTreeMap<String, Value>;

/// Full contents of an [`InMemoryDocumentStore`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStoreSnapshot {
    pub collections: BTreeMap<String, Collection>,
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<DocumentStoreSnapshot>,
    mirror: Mirror,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("collections", &self.state.read().collections.len())
            .field("persistent", &self.mirror.is_durable())
            .field("suspended", &self.mirror.is_suspended())
            .finish()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let mirror = Mirror::new(Some(persistence));
        let state = match mirror.restore()? {
            Some(value) => serde_json::from_value(value)?,
            None => DocumentStoreSnapshot::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            mirror,
        })
    }

    pub fn export(&self) -> DocumentStoreSnapshot {
        self.state.read().clone()
    }

    pub fn import(&self, snapshot: DocumentStoreSnapshot) -> Result<()> {
        *self.state.write() = snapshot;
        self.persist()
    }

    pub fn suspend_persistence(&self) {
        self.mirror.suspend();
    }

    pub fn resume_persistence(&self) {
        self.mirror.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.mirror.is_suspended()
    }

    pub fn flush(&self) -> Result<()> {
        self.mirror.flush(&*self.state.read())
    }

    fn persist(&self) -> Result<()> {
        self.mirror.persist(&*self.state.read())
    }

    fn read<T>(&self, collection: &str, f: impl FnOnce(&Collection) -> T) -> Result<T> {
        let state = self.state.read();
        let docs = state
            .collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(f(docs))
    }

    /// Runs `f` against one collection under the write lock and persists
    /// when `f` reports at least one change. A failed save restores the
    /// collection before the lock is released.
    fn write<F>(&self, collection: &str, f: F) -> Result<u64>
    where
        F: FnOnce(&mut Collection) -> Result<u64>,
    {
        let mut state = self.state.write();
        let docs = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let before = (self.mirror.is_durable() && !self.mirror.is_suspended())
            .then(|| docs.clone());
        let changed = f(docs)?;
        if changed == 0 {
            return Ok(0);
        }
        if let Err(err) = self.mirror.persist(&*state) {
            if let (Some(before), Some(docs)) = (before, state.collections.get_mut(collection)) {
                *docs = before;
            }
            tracing::warn!(target: "docket::documents", collection, error = %err, "write rolled back");
            return Err(err);
        }
        drop(state);
        metrics::record_doc_write(changed);
        Ok(changed)
    }

    fn select(docs: &Collection, filter: &Filter, options: &FindOptions) -> Vec<(String, Value)> {
        let mut matched: Vec<(String, Value)> = docs
            .iter()
            .filter(|(id, doc)| filter.matches(id, doc))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();
        if !options.order_by.is_empty() {
            sort_docs(&mut matched, &options.order_by);
        }
        paginate(matched, options)
    }
}

fn matching_ids(docs: &Collection, filter: &Filter) -> Vec<String> {
    docs.iter()
        .filter(|(id, doc)| filter.matches(id, doc))
        .map(|(id, _)| id.clone())
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn add_collection(&self, collection: &str) -> Result<()> {
        let created = {
            let mut state = self.state.write();
            if state.collections.contains_key(collection) {
                false
            } else {
                state
                    .collections
                    .insert(collection.to_string(), Collection::new());
                true
            }
        };
        if created {
            tracing::debug!(target: "docket::documents", collection, "created collection");
            self.persist()?;
        }
        Ok(())
    }

    async fn has_collection(&self, collection: &str) -> Result<bool> {
        Ok(self.state.read().collections.contains_key(collection))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        if self.state.write().collections.remove(collection).is_none() {
            return Err(Error::CollectionNotFound(collection.to_string()));
        }
        tracing::debug!(target: "docket::documents", collection, "dropped collection");
        self.persist()
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.state.read().collections.keys().cloned().collect())
    }

    async fn add_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        ensure_object(collection, id, &doc)?;
        self.write(collection, |docs| {
            if docs.contains_key(id) {
                return Err(Error::DocumentExists {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            docs.insert(id.to_string(), doc);
            Ok(1)
        })?;
        Ok(())
    }

    async fn update_doc(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        ensure_object(collection, id, &patch)?;
        self.write(collection, |docs| {
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| doc_not_found(collection, id))?;
            merge_shallow(doc, &patch);
            Ok(1)
        })?;
        Ok(())
    }

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        ensure_object(collection, id, &doc)?;
        self.write(collection, |docs| {
            match docs.get_mut(id) {
                Some(existing) => merge_shallow(existing, &doc),
                None => {
                    docs.insert(id.to_string(), doc);
                }
            }
            Ok(1)
        })?;
        Ok(())
    }

    async fn replace_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        ensure_object(collection, id, &doc)?;
        self.write(collection, |docs| {
            let existing = docs
                .get_mut(id)
                .ok_or_else(|| doc_not_found(collection, id))?;
            *existing = doc;
            Ok(1)
        })?;
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()> {
        self.write(collection, |docs| Ok(u64::from(docs.remove(id).is_some())))?;
        Ok(())
    }

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let doc = self.read(collection, |docs| docs.get(id).cloned())?;
        metrics::record_doc_read(u64::from(doc.is_some()));
        Ok(doc)
    }

    async fn get_partial_doc(
        &self,
        collection: &str,
        id: &str,
        select: &PartialSelect,
    ) -> Result<Option<Value>> {
        Ok(self
            .get_doc(collection, id)
            .await?
            .map(|doc| select.apply(&doc)))
    }

    async fn find_docs(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>> {
        let found = self.read(collection, |docs| Self::select(docs, filter, options))?;
        metrics::record_doc_read(found.len() as u64);
        Ok(found)
    }

    async fn find_partial_docs(
        &self,
        collection: &str,
        select: &PartialSelect,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>> {
        Ok(self
            .find_docs(collection, filter, options)
            .await?
            .into_iter()
            .map(|(id, doc)| {
                let projected = select.apply(&doc);
                (id, projected)
            })
            .collect())
    }

    async fn find_doc_ids(&self, collection: &str, filter: &Filter) -> Result<Vec<String>> {
        self.read(collection, |docs| matching_ids(docs, filter))
    }

    async fn count_docs(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.read(collection, |docs| {
            docs.iter().filter(|(id, doc)| filter.matches(id, doc)).count() as u64
        })
    }

    async fn update_many(&self, collection: &str, filter: &Filter, patch: Value) -> Result<u64> {
        ensure_object(collection, "*", &patch)?;
        self.write(collection, |docs| {
            let ids = matching_ids(docs, filter);
            for id in &ids {
                if let Some(doc) = docs.get_mut(id) {
                    merge_shallow(doc, &patch);
                }
            }
            Ok(ids.len() as u64)
        })
    }

    async fn replace_many(&self, collection: &str, filter: &Filter, doc: Value) -> Result<u64> {
        ensure_object(collection, "*", &doc)?;
        self.write(collection, |docs| {
            let ids = matching_ids(docs, filter);
            for id in &ids {
                docs.insert(id.clone(), doc.clone());
            }
            Ok(ids.len() as u64)
        })
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.write(collection, |docs| {
            let before = docs.len();
            docs.retain(|id, doc| !filter.matches(id, doc));
            Ok((before - docs.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        store.add_collection("orders").await.unwrap();
        store
            .add_doc("orders", "1", json!({"status": "open", "total": 10}))
            .await
            .unwrap();
        store
            .add_doc("orders", "2", json!({"status": "closed", "total": 30}))
            .await
            .unwrap();
        store
            .add_doc("orders", "3", json!({"status": "open", "total": 20}))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn missing_collection_is_reported() {
        let store = InMemoryDocumentStore::new();
        let err = store.get_doc("nope", "1").await.unwrap_err();
        assert!(matches!(err, Error::CollectionNotFound(_)));
        assert!(!store.has_collection("nope").await.unwrap());
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_non_objects() {
        let store = seeded().await;
        let err = store.add_doc("orders", "1", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::DocumentExists { .. }));
        let err = store.add_doc("orders", "9", json!([1])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn update_merges_and_replace_overwrites() {
        let store = seeded().await;
        store
            .update_doc("orders", "1", json!({"status": "closed"}))
            .await
            .unwrap();
        assert_eq!(
            store.get_doc("orders", "1").await.unwrap(),
            Some(json!({"status": "closed", "total": 10}))
        );
        store
            .replace_doc("orders", "1", json!({"note": "x"}))
            .await
            .unwrap();
        assert_eq!(
            store.get_doc("orders", "1").await.unwrap(),
            Some(json!({"note": "x"}))
        );
        let err = store
            .update_doc("orders", "missing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        store.delete_doc("orders", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn find_sorts_and_pages() {
        let store = seeded().await;
        let found = store
            .find_docs(
                "orders",
                &Filter::eq("status", "open"),
                &FindOptions::new().order_by("total", crate::documents::SortDirection::Desc),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
        let page = store
            .find_docs("orders", &Filter::Any, &FindOptions::new().skip(1).limit(1))
            .await
            .unwrap();
        assert_eq!(page[0].0, "2");
    }

    #[tokio::test]
    async fn bulk_operations_report_counts() {
        let store = seeded().await;
        let open = Filter::eq("status", "open");
        assert_eq!(store.count_docs("orders", &open).await.unwrap(), 2);
        assert_eq!(
            store
                .update_many("orders", &open, json!({"flag": true}))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_docs("orders", &Filter::eq("flag", true))
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.delete_many("orders", &open).await.unwrap(), 2);
        assert_eq!(store.find_doc_ids("orders", &Filter::Any).await.unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn failed_save_restores_the_collection() {
        let persistence = Arc::new(crate::testing::FlakyPersistence::new());
        let store = InMemoryDocumentStore::open(persistence.clone()).unwrap();
        store.add_collection("orders").await.unwrap();
        store
            .add_doc("orders", "1", json!({"status": "open"}))
            .await
            .unwrap();

        persistence.fail_saves(true);
        assert!(store.add_doc("orders", "2", json!({})).await.is_err());
        assert!(
            store
                .update_doc("orders", "1", json!({"status": "paid"}))
                .await
                .is_err()
        );
        assert_eq!(store.find_doc_ids("orders", &Filter::Any).await.unwrap(), vec!["1"]);
        assert_eq!(
            store.get_doc("orders", "1").await.unwrap(),
            Some(json!({"status": "open"}))
        );

        // suspended stores skip saving, so nothing needs undoing
        store.suspend_persistence();
        store.add_doc("orders", "2", json!({})).await.unwrap();
        assert_eq!(store.count_docs("orders", &Filter::Any).await.unwrap(), 2);
    }
}
