//! Docket: event store, document store, multi-model sessions and a rule
//! interpreter for low-code runtimes, in memory or on Postgres.

pub mod coordinator;
pub mod documents;
mod error;
pub mod events;
pub mod filter;
pub mod identity;
pub mod metrics;
pub mod persistence;
pub mod rules;
pub mod schema;
pub mod session;
pub mod store;
pub mod testing;
pub mod validation;

pub use coordinator::{InMemoryMultiModelStore, MultiModelStore, PgMultiModelStore};
pub use documents::{DocumentStore, FindOptions, PartialSelect, SortDirection};
pub use error::{Error, FieldError, Result, WithContext};
pub use events::{Event, EventStore, LoadOptions, MetadataMatcher, StreamKind};
pub use filter::Filter;
pub use rules::{Interpreter, Rule, Then};
pub use session::Session;
pub use store::Store;

pub mod prelude {
    pub use crate::{
        DocumentStore, Error, Event, EventStore, Filter, FindOptions, Interpreter, LoadOptions,
        MetadataMatcher, MultiModelStore, Result, Rule, Session, Store, StreamKind,
    };
}
