//! Helpers for tests of code built on the stores.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use sqlx::PgPool;

use crate::{
    Result,
    events::{AppendListener, AppendNotice, Event},
    persistence::Persistence,
    store::Store,
};

/// Append listener that keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    notices: Mutex<Vec<AppendNotice>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<AppendNotice> {
        self.notices.lock().clone()
    }

    /// Every delivered event in delivery order.
    pub fn events(&self) -> Vec<Event> {
        self.notices
            .lock()
            .iter()
            .flat_map(|notice| notice.events.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.notices.lock().clear();
    }
}

impl AppendListener for RecordingListener {
    fn on_append(&self, stream: &str, events: &[Event], is_replay: bool) {
        self.notices.lock().push(AppendNotice {
            stream: stream.to_string(),
            events: events.to_vec(),
            is_replay,
        });
    }
}

/// Persistence held in memory whose saves can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    saved: Mutex<Option<Value>>,
    failing: AtomicBool,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The last state saved successfully.
    pub fn saved(&self) -> Option<Value> {
        self.saved.lock().clone()
    }
}

impl Persistence for FlakyPersistence {
    fn save(&self, state: &Value) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("save refused").into());
        }
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>> {
        Ok(self.saved())
    }
}

/// Write-model event for aggregate `Order/{id}` at `version`.
pub fn order_event(name: &str, id: &str, version: u64) -> Event {
    Event::new(name, json!({ "orderId": id })).for_aggregate("Order", id, version)
}

/// Store on `pool` using a migrated schema of its own.
pub async fn isolated_store(pool: PgPool, schema: &str) -> Result<Store> {
    let store = Store::from_pool(pool, schema);
    store.migrate().await?;
    Ok(store)
}
