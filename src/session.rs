//! Unit of work: a write-only buffer of tasks a coordinator replays once.

use serde_json::Value;
use uuid::Uuid;

use crate::{
    Error, Result,
    events::{Event, MetadataMatcher},
    filter::Filter,
};

/// Replay order of tasks on commit. Declaration order is replay order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskCategory {
    AppendEvents,
    DeleteEvents,
    InsertDoc,
    UpsertDoc,
    UpdateDoc,
    ReplaceDoc,
    DeleteDoc,
    UpdateMany,
    ReplaceMany,
    DeleteMany,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    AppendEvents {
        stream: String,
        events: Vec<Event>,
        matcher: Option<MetadataMatcher>,
        expected_version: Option<u64>,
    },
    DeleteEvents {
        stream: String,
        matcher: MetadataMatcher,
    },
    InsertDoc {
        collection: String,
        id: String,
        doc: Value,
    },
    UpsertDoc {
        collection: String,
        id: String,
        doc: Value,
    },
    UpdateDoc {
        collection: String,
        id: String,
        patch: Value,
    },
    ReplaceDoc {
        collection: String,
        id: String,
        doc: Value,
    },
    DeleteDoc {
        collection: String,
        id: String,
    },
    UpdateMany {
        collection: String,
        filter: Filter,
        patch: Value,
    },
    ReplaceMany {
        collection: String,
        filter: Filter,
        doc: Value,
    },
    DeleteMany {
        collection: String,
        filter: Filter,
    },
}

impl Task {
    pub fn category(&self) -> TaskCategory {
        match self {
            Task::AppendEvents { .. } => TaskCategory::AppendEvents,
            Task::DeleteEvents { .. } => TaskCategory::DeleteEvents,
            Task::InsertDoc { .. } => TaskCategory::InsertDoc,
            Task::UpsertDoc { .. } => TaskCategory::UpsertDoc,
            Task::UpdateDoc { .. } => TaskCategory::UpdateDoc,
            Task::ReplaceDoc { .. } => TaskCategory::ReplaceDoc,
            Task::DeleteDoc { .. } => TaskCategory::DeleteDoc,
            Task::UpdateMany { .. } => TaskCategory::UpdateMany,
            Task::ReplaceMany { .. } => TaskCategory::ReplaceMany,
            Task::DeleteMany { .. } => TaskCategory::DeleteMany,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    tasks: Vec<Task>,
    committed: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks: Vec::new(),
            committed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in registration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks in replay order: by category, then registration order.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut ordered: Vec<&Task> = self.tasks.iter().collect();
        ordered.sort_by_key(|task| task.category());
        ordered
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub fn register(&mut self, task: Task) -> Result<()> {
        if self.committed {
            return Err(Error::SessionCommitted);
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn append_events(
        &mut self,
        stream: impl Into<String>,
        events: Vec<Event>,
        matcher: Option<MetadataMatcher>,
        expected_version: Option<u64>,
    ) -> Result<()> {
        self.register(Task::AppendEvents {
            stream: stream.into(),
            events,
            matcher,
            expected_version,
        })
    }

    pub fn delete_events(
        &mut self,
        stream: impl Into<String>,
        matcher: MetadataMatcher,
    ) -> Result<()> {
        self.register(Task::DeleteEvents {
            stream: stream.into(),
            matcher,
        })
    }

    pub fn insert_doc(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        doc: Value,
    ) -> Result<()> {
        self.register(Task::InsertDoc {
            collection: collection.into(),
            id: id.into(),
            doc,
        })
    }

    pub fn upsert_doc(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        doc: Value,
    ) -> Result<()> {
        self.register(Task::UpsertDoc {
            collection: collection.into(),
            id: id.into(),
            doc,
        })
    }

    pub fn update_doc(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        patch: Value,
    ) -> Result<()> {
        self.register(Task::UpdateDoc {
            collection: collection.into(),
            id: id.into(),
            patch,
        })
    }

    pub fn replace_doc(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        doc: Value,
    ) -> Result<()> {
        self.register(Task::ReplaceDoc {
            collection: collection.into(),
            id: id.into(),
            doc,
        })
    }

    pub fn delete_doc(&mut self, collection: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.register(Task::DeleteDoc {
            collection: collection.into(),
            id: id.into(),
        })
    }

    pub fn update_many(
        &mut self,
        collection: impl Into<String>,
        filter: Filter,
        patch: Value,
    ) -> Result<()> {
        self.register(Task::UpdateMany {
            collection: collection.into(),
            filter,
            patch,
        })
    }

    pub fn replace_many(
        &mut self,
        collection: impl Into<String>,
        filter: Filter,
        doc: Value,
    ) -> Result<()> {
        self.register(Task::ReplaceMany {
            collection: collection.into(),
            filter,
            doc,
        })
    }

    pub fn delete_many(&mut self, collection: impl Into<String>, filter: Filter) -> Result<()> {
        self.register(Task::DeleteMany {
            collection: collection.into(),
            filter,
        })
    }
}
