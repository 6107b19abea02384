//! User lookup collaborator used by the `lookupUser` and `lookupUsers` rule actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    Result,
    documents::{DocumentStore, FindOptions},
    filter::Filter,
};

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Value>>;

    async fn find(&self, filter: &Filter) -> Result<Vec<Value>>;

    async fn register(&self, id: &str, user: Value) -> Result<()>;

    /// Merges `patch` into every matching user; returns how many changed.
    async fn update(&self, filter: &Filter, patch: Value) -> Result<u64>;
}

/// Keeps users as documents of one collection, keyed by user id.
#[derive(Clone)]
pub struct DocumentIdentityService {
    documents: Arc<dyn DocumentStore>,
    collection: String,
}

impl std::fmt::Debug for DocumentIdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentIdentityService")
            .field("collection", &self.collection)
            .finish()
    }
}

impl DocumentIdentityService {
    pub const DEFAULT_COLLECTION: &'static str = "users";

    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self::with_collection(documents, Self::DEFAULT_COLLECTION)
    }

    pub fn with_collection(documents: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            documents,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn ready(&self) -> Result<bool> {
        self.documents.has_collection(&self.collection).await
    }
}

#[async_trait]
impl IdentityService for DocumentIdentityService {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        if !self.ready().await? {
            return Ok(None);
        }
        self.documents.get_doc(&self.collection, id).await
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Value>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let found = self
            .documents
            .find_docs(&self.collection, filter, &FindOptions::new())
            .await?;
        Ok(found.into_iter().map(|(_, user)| user).collect())
    }

    async fn register(&self, id: &str, user: Value) -> Result<()> {
        if !self.ready().await? {
            self.documents.add_collection(&self.collection).await?;
        }
        self.documents.add_doc(&self.collection, id, user).await
    }

    async fn update(&self, filter: &Filter, patch: Value) -> Result<u64> {
        if !self.ready().await? {
            return Ok(0);
        }
        self.documents
            .update_many(&self.collection, filter, patch)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::memory::InMemoryDocumentStore;
    use serde_json::json;

    #[tokio::test]
    async fn registers_finds_and_updates_users() {
        let identity = DocumentIdentityService::new(Arc::new(InMemoryDocumentStore::new()));
        assert_eq!(identity.get("u1").await.unwrap(), None);

        identity
            .register("u1", json!({"name": "Ada", "role": "admin"}))
            .await
            .unwrap();
        identity
            .register("u2", json!({"name": "Bob", "role": "clerk"}))
            .await
            .unwrap();
        assert_eq!(
            identity.get("u1").await.unwrap(),
            Some(json!({"name": "Ada", "role": "admin"}))
        );

        let changed = identity
            .update(&Filter::eq("role", "clerk"), json!({"active": false}))
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let inactive = identity.find(&Filter::eq("active", false)).await.unwrap();
        assert_eq!(inactive, vec![json!({"name": "Bob", "role": "clerk", "active": false})]);
    }
}
