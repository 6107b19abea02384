//! Commits a [`Session`] across the event store and the document store.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::{
    Error, Result,
    documents::{
        DocumentStore,
        memory::InMemoryDocumentStore,
        postgres::{self as pg_docs, PgDocumentStore},
    },
    events::{
        Event, EventStore,
        memory::InMemoryEventStore,
        postgres::{self as pg_events, PgEventStore},
    },
    metrics,
    session::{Session, Task},
};

#[async_trait]
pub trait MultiModelStore: Send + Sync {
    fn events(&self) -> &dyn EventStore;

    fn documents(&self) -> &dyn DocumentStore;

    /// Replays the session's tasks. Either all of them take effect or none do.
    /// The session is marked committed whatever the outcome.
    async fn commit(&self, session: &mut Session) -> Result<()>;
}

fn begin_commit(session: &mut Session) -> Result<()> {
    if session.is_committed() {
        return Err(Error::SessionCommitted);
    }
    session.mark_committed();
    Ok(())
}

/// Applies one task through the stores' ordinary operations.
pub(crate) async fn apply_task(
    events: &dyn EventStore,
    documents: &dyn DocumentStore,
    task: &Task,
) -> Result<()> {
    match task {
        Task::AppendEvents {
            stream,
            events: batch,
            matcher,
            expected_version,
        } => {
            events
                .append_to(stream, batch.clone(), matcher.as_ref(), *expected_version)
                .await
        }
        Task::DeleteEvents { stream, matcher } => events.delete(stream, matcher).await.map(drop),
        Task::InsertDoc {
            collection,
            id,
            doc,
        } => documents.add_doc(collection, id, doc.clone()).await,
        Task::UpsertDoc {
            collection,
            id,
            doc,
        } => documents.upsert_doc(collection, id, doc.clone()).await,
        Task::UpdateDoc {
            collection,
            id,
            patch,
        } => documents.update_doc(collection, id, patch.clone()).await,
        Task::ReplaceDoc {
            collection,
            id,
            doc,
        } => documents.replace_doc(collection, id, doc.clone()).await,
        Task::DeleteDoc { collection, id } => documents.delete_doc(collection, id).await,
        Task::UpdateMany {
            collection,
            filter,
            patch,
        } => documents
            .update_many(collection, filter, patch.clone())
            .await
            .map(drop),
        Task::ReplaceMany {
            collection,
            filter,
            doc,
        } => documents
            .replace_many(collection, filter, doc.clone())
            .await
            .map(drop),
        Task::DeleteMany { collection, filter } => {
            documents.delete_many(collection, filter).await.map(drop)
        }
    }
}

/// Shadow-copy coordinator for the in-memory stores.
///
/// Commit exports both stores, replays the session with persistence
/// suspended, and imports the exports again if any task fails. Commits are
/// serialized so a rollback never restores over another commit.
#[derive(Debug, Default)]
pub struct InMemoryMultiModelStore {
    events: Arc<InMemoryEventStore>,
    documents: Arc<InMemoryDocumentStore>,
    commit_lock: Mutex<()>,
}

impl InMemoryMultiModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stores(events: Arc<InMemoryEventStore>, documents: Arc<InMemoryDocumentStore>) -> Self {
        Self {
            events,
            documents,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn event_store(&self) -> Arc<InMemoryEventStore> {
        self.events.clone()
    }

    pub fn document_store(&self) -> Arc<InMemoryDocumentStore> {
        self.documents.clone()
    }

    async fn replay_and_flush(&self, session: &Session) -> Result<()> {
        for task in session.ordered_tasks() {
            apply_task(self.events.as_ref(), self.documents.as_ref(), task).await?;
        }
        self.events.resume_persistence();
        self.documents.resume_persistence();
        self.events.flush()?;
        self.documents.flush()
    }

    fn restore(
        &self,
        events: crate::events::memory::EventStoreSnapshot,
        documents: crate::documents::memory::DocumentStoreSnapshot,
    ) {
        self.events.suspend_persistence();
        self.documents.suspend_persistence();
        let imported = self
            .events
            .import(events)
            .and_then(|_| self.documents.import(documents));
        self.events.discard_deferred();
        self.events.resume_persistence();
        self.documents.resume_persistence();
        let flushed = imported
            .and_then(|_| self.events.flush())
            .and_then(|_| self.documents.flush());
        if let Err(err) = flushed {
            warn!(target: "docket::coordinator", error = %err, "failed to persist restored state");
        }
    }
}

#[async_trait]
impl MultiModelStore for InMemoryMultiModelStore {
    fn events(&self) -> &dyn EventStore {
        self.events.as_ref()
    }

    fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    #[instrument(skip_all, fields(session = %session.id(), tasks = session.len()))]
    async fn commit(&self, session: &mut Session) -> Result<()> {
        begin_commit(session)?;
        let _guard = self.commit_lock.lock().await;

        let events_snapshot = self.events.export();
        let documents_snapshot = self.documents.export();
        self.events.suspend_persistence();
        self.documents.suspend_persistence();

        match self.replay_and_flush(session).await {
            Ok(()) => {
                self.events.release_deferred();
                metrics::record_commit();
                tracing::debug!(target: "docket::coordinator", "session committed");
                Ok(())
            }
            Err(err) => {
                self.restore(events_snapshot, documents_snapshot);
                metrics::record_rollback();
                tracing::debug!(target: "docket::coordinator", error = %err, "session rolled back");
                Err(err)
            }
        }
    }
}

/// Coordinator replaying sessions inside one Postgres transaction.
#[derive(Debug, Clone)]
pub struct PgMultiModelStore {
    events: Arc<PgEventStore>,
    documents: Arc<PgDocumentStore>,
}

impl PgMultiModelStore {
    pub fn new(events: Arc<PgEventStore>, documents: Arc<PgDocumentStore>) -> Self {
        Self { events, documents }
    }

    pub fn event_store(&self) -> Arc<PgEventStore> {
        self.events.clone()
    }

    pub fn document_store(&self) -> Arc<PgDocumentStore> {
        self.documents.clone()
    }

    async fn apply_in(
        &self,
        conn: &mut PgConnection,
        task: &Task,
        appended: &mut Vec<(String, Vec<Event>)>,
    ) -> Result<()> {
        let event_schema = self.events.schema();
        let doc_schema = self.documents.schema();
        match task {
            Task::AppendEvents {
                stream,
                events,
                matcher,
                expected_version,
            } => {
                pg_events::append_in(
                    conn,
                    event_schema,
                    stream,
                    events,
                    matcher.as_ref(),
                    *expected_version,
                )
                .await?;
                if !events.is_empty() {
                    appended.push((stream.clone(), events.clone()));
                }
            }
            Task::DeleteEvents { stream, matcher } => {
                pg_events::delete_in(conn, event_schema, stream, matcher).await?;
            }
            Task::InsertDoc {
                collection,
                id,
                doc,
            } => pg_docs::add_doc_in(conn, doc_schema, collection, id, doc).await?,
            Task::UpsertDoc {
                collection,
                id,
                doc,
            } => pg_docs::upsert_doc_in(conn, doc_schema, collection, id, doc).await?,
            Task::UpdateDoc {
                collection,
                id,
                patch,
            } => pg_docs::update_doc_in(conn, doc_schema, collection, id, patch).await?,
            Task::ReplaceDoc {
                collection,
                id,
                doc,
            } => pg_docs::replace_doc_in(conn, doc_schema, collection, id, doc).await?,
            Task::DeleteDoc { collection, id } => {
                pg_docs::delete_doc_in(conn, doc_schema, collection, id).await?
            }
            Task::UpdateMany {
                collection,
                filter,
                patch,
            } => {
                pg_docs::update_many_in(conn, doc_schema, collection, filter, patch).await?;
            }
            Task::ReplaceMany {
                collection,
                filter,
                doc,
            } => {
                pg_docs::replace_many_in(conn, doc_schema, collection, filter, doc).await?;
            }
            Task::DeleteMany { collection, filter } => {
                pg_docs::delete_many_in(conn, doc_schema, collection, filter).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MultiModelStore for PgMultiModelStore {
    fn events(&self) -> &dyn EventStore {
        self.events.as_ref()
    }

    fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    #[instrument(skip_all, fields(session = %session.id(), tasks = session.len()))]
    async fn commit(&self, session: &mut Session) -> Result<()> {
        begin_commit(session)?;
        let mut tx = self.events.pool().begin().await?;
        let mut appended = Vec::new();
        for task in session.ordered_tasks() {
            if let Err(err) = self.apply_in(&mut tx, task, &mut appended).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(target: "docket::coordinator", error = %rollback_err, "rollback failed");
                }
                metrics::record_rollback();
                tracing::debug!(target: "docket::coordinator", error = %err, "session rolled back");
                return Err(err);
            }
        }
        tx.commit().await?;
        metrics::record_commit();

        let listeners = self.events.listeners();
        for (stream, events) in appended {
            metrics::record_event_appends(events.len() as u64);
            listeners.notify(&stream, &events, false);
        }
        tracing::debug!(target: "docket::coordinator", "session committed");
        Ok(())
    }
}
