use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{
    AppendNotice, Event, EventStore, EventStream, Listeners, LoadOptions, MetadataMatcher,
    StreamKind, match_event, select_events, validate_events,
};
use crate::{
    Error, Result, metrics,
    persistence::{Mirror, Persistence},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub kind: StreamKind,
    pub events: Vec<Event>,
}

/// Full contents of an [`InMemoryEventStore`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStoreSnapshot {
    pub streams: BTreeMap<String, StreamState>,
}

/// Event store kept in process memory, optionally mirrored to a [`Persistence`].
///
/// Appends check the expected version and write under the same lock, so
/// concurrent writers to one store never interleave between check and append.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: RwLock<EventStoreSnapshot>,
    listeners: Listeners,
    mirror: Mirror,
    deferred: Mutex<Vec<AppendNotice>>,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("streams", &self.state.read().streams.len())
            .field("persistent", &self.mirror.is_durable())
            .field("suspended", &self.mirror.is_suspended())
            .finish()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by `persistence`, restoring whatever it last saved.
    pub fn open(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let mirror = Mirror::new(Some(persistence));
        let state = match mirror.restore()? {
            Some(value) => serde_json::from_value(value)?,
            None => EventStoreSnapshot::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            mirror,
            ..Self::default()
        })
    }

    pub fn export(&self) -> EventStoreSnapshot {
        self.state.read().clone()
    }

    /// Replaces the entire state. Listeners are not told.
    pub fn import(&self, snapshot: EventStoreSnapshot) -> Result<()> {
        *self.state.write() = snapshot;
        self.persist()
    }

    /// Stops writing to durable storage and starts holding back notifications.
    pub fn suspend_persistence(&self) {
        self.mirror.suspend();
    }

    pub fn resume_persistence(&self) {
        self.mirror.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.mirror.is_suspended()
    }

    /// Writes the current state to durable storage, suspended or not.
    pub fn flush(&self) -> Result<()> {
        self.mirror.flush(&*self.state.read())
    }

    /// Delivers notifications held back while suspended, in append order.
    pub fn release_deferred(&self) {
        let pending = std::mem::take(&mut *self.deferred.lock());
        for notice in pending {
            self.listeners
                .notify(&notice.stream, &notice.events, notice.is_replay);
        }
    }

    pub fn discard_deferred(&self) {
        let dropped = std::mem::take(&mut *self.deferred.lock());
        if !dropped.is_empty() {
            tracing::debug!(target: "docket::events", notices = dropped.len(), "discarded deferred notifications");
        }
    }

    fn persist(&self) -> Result<()> {
        self.mirror.persist(&*self.state.read())
    }

    fn announce(&self, stream: &str, events: Vec<Event>, is_replay: bool) {
        if self.is_suspended() {
            self.deferred.lock().push(AppendNotice {
                stream: stream.to_string(),
                events,
                is_replay,
            });
        } else {
            self.listeners.notify(stream, &events, is_replay);
        }
    }

    fn check_unique(stream: &str, state: &StreamState, events: &[Event]) -> Result<()> {
        for (idx, event) in events.iter().enumerate() {
            if state.events.iter().any(|e| e.uuid == event.uuid) {
                return Err(Error::InvalidEvent(format!(
                    "event {} already exists in `{stream}`",
                    event.uuid
                )));
            }
            if state.kind != StreamKind::WriteModel {
                continue;
            }
            let Some(key) = event.write_model_key() else {
                continue;
            };
            let taken = state
                .events
                .iter()
                .chain(&events[..idx])
                .any(|e| e.write_model_key() == Some(key));
            if taken {
                metrics::record_event_conflict();
                return Err(super::version_taken(stream, key.2));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn has_stream(&self, stream: &str) -> Result<bool> {
        Ok(self.state.read().streams.contains_key(stream))
    }

    async fn create_stream(&self, stream: &str, kind: StreamKind) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.streams.contains_key(stream) {
                return Err(Error::StreamExists(stream.to_string()));
            }
            state.streams.insert(
                stream.to_string(),
                StreamState {
                    kind,
                    events: Vec::new(),
                },
            );
        }
        tracing::debug!(target: "docket::events", stream, kind = kind.as_str(), "created stream");
        self.persist()
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        if self.state.write().streams.remove(stream).is_none() {
            return Err(Error::StreamNotFound(stream.to_string()));
        }
        tracing::debug!(target: "docket::events", stream, "deleted stream");
        self.persist()
    }

    async fn stream_names(&self) -> Result<Vec<String>> {
        Ok(self.state.read().streams.keys().cloned().collect())
    }

    async fn append_to(
        &self,
        stream: &str,
        events: Vec<Event>,
        matcher: Option<&MetadataMatcher>,
        expected_version: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let existed = state.streams.contains_key(stream);
        let entry = state.streams.entry(stream.to_string()).or_default();
        validate_events(stream, entry.kind, &events)?;
        if let (Some(matcher), Some(expected)) = (matcher, expected_version) {
            let actual = entry
                .events
                .iter()
                .filter(|e| match_event(e, matcher))
                .count() as u64;
            if actual != expected {
                metrics::record_event_conflict();
                tracing::debug!(target: "docket::events", stream, expected, actual, "append rejected");
                return Err(Error::Concurrency {
                    stream: stream.to_string(),
                    expected,
                    actual,
                });
            }
        }
        Self::check_unique(stream, entry, &events)?;
        if events.is_empty() {
            return Ok(());
        }
        let previous = entry.events.len();
        entry.events.extend(events.iter().cloned());

        // readers must never see events the mirror failed to save
        if let Err(err) = self.mirror.persist(&*state) {
            if existed {
                if let Some(entry) = state.streams.get_mut(stream) {
                    entry.events.truncate(previous);
                }
            } else {
                state.streams.remove(stream);
            }
            tracing::warn!(target: "docket::events", stream, error = %err, "append rolled back");
            return Err(err);
        }
        drop(state);

        metrics::record_event_appends(events.len() as u64);
        tracing::debug!(target: "docket::events", stream, count = events.len(), "appended events");
        self.announce(stream, events, false);
        Ok(())
    }

    async fn load(&self, stream: &str, options: LoadOptions) -> Result<EventStream> {
        let selected = {
            let state = self.state.read();
            state
                .streams
                .get(stream)
                .map(|s| select_events(&s.events, &options))
        };
        let selected = match selected {
            Some(events) => events,
            None => {
                self.state
                    .write()
                    .streams
                    .entry(stream.to_string())
                    .or_default();
                self.persist()?;
                Vec::new()
            }
        };
        Ok(futures::stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn delete(&self, stream: &str, matcher: &MetadataMatcher) -> Result<u64> {
        let removed = {
            let mut state = self.state.write();
            let entry = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
            let before = entry.events.len();
            entry.events.retain(|e| !match_event(e, matcher));
            (before - entry.events.len()) as u64
        };
        if removed > 0 {
            metrics::record_event_deletes(removed);
            self.persist()?;
        }
        tracing::debug!(target: "docket::events", stream, removed, "deleted events");
        Ok(removed)
    }

    async fn republish(&self, stream: &str, options: LoadOptions) -> Result<u64> {
        let selected = {
            let state = self.state.read();
            let entry = state
                .streams
                .get(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
            select_events(&entry.events, &options)
        };
        let count = selected.len() as u64;
        self.announce(stream, selected, true);
        Ok(count)
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}
