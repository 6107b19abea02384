use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    Result,
    coordinator::{InMemoryMultiModelStore, MultiModelStore, PgMultiModelStore},
    documents::{memory::InMemoryDocumentStore, postgres::PgDocumentStore},
    events::{memory::InMemoryEventStore, postgres::PgEventStore},
    persistence::FilePersistence,
    schema::{SchemaManager, SchemaPlan},
    session::Session,
};

pub const DEFAULT_SCHEMA: &str = "public";
pub const EVENTS_FILE: &str = "events.json";
pub const DOCUMENTS_FILE: &str = "documents.json";

/// Postgres-backed event store, document store and session coordinator
/// sharing one pool and one schema.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
    schema: String,
    coordinator: PgMultiModelStore,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::builder(url).build().await
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn from_pool(pool: PgPool, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        let events = Arc::new(PgEventStore::new(pool.clone(), schema.clone()));
        let documents = Arc::new(PgDocumentStore::new(pool.clone(), schema.clone()));
        Self {
            pool,
            schema,
            coordinator: PgMultiModelStore::new(events, documents),
        }
    }

    pub fn events(&self) -> Arc<PgEventStore> {
        self.coordinator.event_store()
    }

    pub fn documents(&self) -> Arc<PgDocumentStore> {
        self.coordinator.document_store()
    }

    pub fn coordinator(&self) -> &PgMultiModelStore {
        &self.coordinator
    }

    pub fn session(&self) -> Session {
        Session::new()
    }

    pub async fn commit(&self, session: &mut Session) -> Result<()> {
        self.coordinator.commit(session).await
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone(), self.schema.clone())
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    /// Creates the registry tables if they are missing.
    pub async fn migrate(&self) -> Result<SchemaPlan> {
        self.schema().sync().await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth {
            ok: one == 1,
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
    pub size: u32,
    pub idle: usize,
}

pub struct StoreBuilder {
    url: String,
    schema: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    prepared_statement_cache_size: Option<usize>,
    migrate: bool,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            max_connections: None,
            connect_timeout: None,
            prepared_statement_cache_size: None,
            migrate: false,
        }
    }

    /// Schema holding the registry, stream and collection tables.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn prepared_statement_cache_size(mut self, size: usize) -> Self {
        self.prepared_statement_cache_size = Some(size.max(1));
        self
    }

    /// Runs [`Store::migrate`] as part of `build`.
    pub fn migrate(mut self, enable: bool) -> Self {
        self.migrate = enable;
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        let pool = if let Some(cap) = self.prepared_statement_cache_size {
            let connect_opts = PgConnectOptions::from_str(&self.url)
                .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?
                .statement_cache_capacity(cap);
            opts.connect_with(connect_opts).await?
        } else {
            opts.connect(&self.url).await?
        };
        let store = Store::from_pool(pool, self.schema);
        if self.migrate {
            let plan = store.migrate().await?;
            tracing::info!(target: "docket::store", schema = %store.schema, actions = plan.actions().len(), "store migrated");
        }
        Ok(store)
    }
}

/// Opens in-memory stores persisted as JSON files under `dir`.
///
/// Existing files are loaded; a corrupt file fails the open.
pub fn open_in_memory(dir: impl AsRef<Path>) -> Result<InMemoryMultiModelStore> {
    let dir = dir.as_ref();
    let events = InMemoryEventStore::open(Arc::new(FilePersistence::new(dir.join(EVENTS_FILE))))?;
    let documents =
        InMemoryDocumentStore::open(Arc::new(FilePersistence::new(dir.join(DOCUMENTS_FILE))))?;
    Ok(InMemoryMultiModelStore::with_stores(
        Arc::new(events),
        Arc::new(documents),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::DocumentStore;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_store_reopens_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_in_memory(dir.path()).unwrap();
            store.documents().add_collection("orders").await.unwrap();
            let mut session = Session::new();
            session.insert_doc("orders", "1", json!({"total": 3})).unwrap();
            store.commit(&mut session).await.unwrap();
        }
        let reopened = open_in_memory(dir.path()).unwrap();
        assert_eq!(
            reopened.documents().get_doc("orders", "1").await.unwrap(),
            Some(json!({"total": 3}))
        );
        assert!(dir.path().join(EVENTS_FILE).exists());
    }

    #[test]
    fn builder_clamps_limits() {
        let builder = StoreBuilder::new("postgres://localhost/docket")
            .max_connections(0)
            .prepared_statement_cache_size(0)
            .schema("tenant_a");
        assert_eq!(builder.max_connections, Some(1));
        assert_eq!(builder.prepared_statement_cache_size, Some(1));
        assert_eq!(builder.schema, "tenant_a");
    }
}
