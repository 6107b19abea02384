//! Append-only event streams with optimistic concurrency and metadata matching.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{TryStreamExt, stream::BoxStream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Error, Result, filter::json, metrics};

pub const META_VISIBILITY: &str = "visibility";
pub const META_VERSION: &str = "version";
pub const META_AGGREGATE_ID: &str = "aggregateId";
pub const META_AGGREGATE_TYPE: &str = "aggregateType";
pub const META_AGGREGATE_VERSION: &str = "aggregateVersion";
pub const META_CAUSATION_ID: &str = "causationId";
pub const META_USER: &str = "user";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Service,
    Archive,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Service => "service",
            Visibility::Archive => "archive",
        }
    }
}

/// Whether a stream enforces aggregate identity on its events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    WriteModel,
    #[default]
    Unconstrained,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::WriteModel => "write-model",
            StreamKind::Unconstrained => "unconstrained",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "write-model" => Some(StreamKind::WriteModel),
            "unconstrained" => Some(StreamKind::Unconstrained),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub uuid: Uuid,
    pub name: String,
    pub payload: Value,
    #[serde(default)]
    pub meta: JsonMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let mut meta = JsonMap::new();
        meta.insert(
            META_VISIBILITY.to_string(),
            Value::from(Visibility::Public.as_str()),
        );
        meta.insert(META_VERSION.to_string(), Value::from(1));
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            payload,
            meta,
            created_at: Utc::now(),
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_visibility(self, visibility: Visibility) -> Self {
        self.with_meta(META_VISIBILITY, visibility.as_str())
    }

    pub fn for_aggregate(
        self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_version: u64,
    ) -> Self {
        self.with_meta(META_AGGREGATE_TYPE, aggregate_type.into())
            .with_meta(META_AGGREGATE_ID, aggregate_id.into())
            .with_meta(META_AGGREGATE_VERSION, aggregate_version)
    }

    pub fn caused_by(self, causation_id: Uuid) -> Self {
        self.with_meta(META_CAUSATION_ID, causation_id.to_string())
    }

    pub fn visibility(&self) -> Option<Visibility> {
        self.meta
            .get(META_VISIBILITY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn version(&self) -> Option<u64> {
        self.meta.get(META_VERSION).and_then(Value::as_u64)
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.meta.get(META_AGGREGATE_TYPE).and_then(Value::as_str)
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.meta.get(META_AGGREGATE_ID).and_then(Value::as_str)
    }

    pub fn aggregate_version(&self) -> Option<u64> {
        self.meta.get(META_AGGREGATE_VERSION).and_then(Value::as_u64)
    }

    /// Resolves a matcher property: intrinsic aliases first, then metadata.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "uuid" => Some(Value::String(self.uuid.to_string())),
            "name" => Some(Value::String(self.name.clone())),
            "createdAt" => Some(Value::String(
                self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            )),
            other => self.meta.get(other).cloned(),
        }
    }

    pub(crate) fn write_model_key(&self) -> Option<(&str, &str, u64)> {
        Some((
            self.aggregate_type()?,
            self.aggregate_id()?,
            self.aggregate_version()?,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "UPPERCASE")]
pub enum Comparison {
    Eq(Value),
    /// Membership form of `EQ`.
    #[serde(rename = "IN")]
    EqAny(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

impl Comparison {
    fn test(&self, actual: &Value) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Eq(expected) => json::json_eq(actual, expected),
            Comparison::EqAny(values) => values.iter().any(|v| json::json_eq(actual, v)),
            Comparison::Gt(v) => json::compare(actual, v) == Greater,
            Comparison::Gte(v) => json::compare(actual, v) != Less,
            Comparison::Lt(v) => json::compare(actual, v) == Less,
            Comparison::Lte(v) => json::compare(actual, v) != Greater,
        }
    }
}

/// Conjunctive predicate over event metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMatcher(BTreeMap<String, Comparison>);

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: impl Into<String>, comparison: Comparison) -> Self {
        self.0.insert(property.into(), comparison);
        self
    }

    pub fn eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Comparison::Eq(value.into()))
    }

    pub fn eq_any<I, V>(self, property: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(
            property,
            Comparison::EqAny(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn gt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Comparison::Gt(value.into()))
    }

    pub fn gte(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Comparison::Gte(value.into()))
    }

    pub fn lt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Comparison::Lt(value.into()))
    }

    pub fn lte(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Comparison::Lte(value.into()))
    }

    /// Matcher selecting every event of one aggregate instance.
    pub fn aggregate(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self::new()
            .eq(META_AGGREGATE_TYPE, aggregate_type.into())
            .eq(META_AGGREGATE_ID, aggregate_id.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Comparison)> {
        self.0.iter()
    }
}

pub fn match_event(event: &Event, matcher: &MetadataMatcher) -> bool {
    matcher.iter().all(|(property, comparison)| {
        event
            .property(property)
            .is_some_and(|actual| comparison.test(&actual))
    })
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub matcher: Option<MetadataMatcher>,
    pub from_event_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn after(mut self, event_id: Uuid) -> Self {
        self.from_event_id = Some(event_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Applies cursor, matcher, ordering and limit, in that order.
pub(crate) fn select_events(events: &[Event], options: &LoadOptions) -> Vec<Event> {
    let start = match options.from_event_id {
        Some(id) => match events.iter().position(|e| e.uuid == id) {
            Some(pos) => pos + 1,
            None => return Vec::new(),
        },
        None => 0,
    };
    let mut selected: Vec<Event> = events[start..]
        .iter()
        .filter(|e| options.matcher.as_ref().is_none_or(|m| match_event(e, m)))
        .cloned()
        .collect();
    if options.reverse {
        selected.reverse();
    }
    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }
    selected
}

/// Rejects events a stream of the given kind must not accept.
pub(crate) fn validate_events(stream: &str, kind: StreamKind, events: &[Event]) -> Result<()> {
    for (idx, event) in events.iter().enumerate() {
        if events[..idx].iter().any(|e| e.uuid == event.uuid) {
            return Err(Error::InvalidEvent(format!(
                "duplicate event uuid {} in append to `{stream}`",
                event.uuid
            )));
        }
        if kind == StreamKind::WriteModel && event.write_model_key().is_none() {
            return Err(Error::InvalidEvent(format!(
                "event `{}` appended to write-model stream `{stream}` lacks aggregateType/aggregateId/aggregateVersion",
                event.name
            )));
        }
    }
    Ok(())
}

/// Conflict raised when an aggregate version is already stored.
pub(crate) fn version_taken(stream: &str, version: u64) -> Error {
    Error::Concurrency {
        stream: stream.to_string(),
        expected: version.saturating_sub(1),
        actual: version,
    }
}

pub type EventStream = BoxStream<'static, Result<Event>>;

#[derive(Clone, Debug)]
pub struct AppendNotice {
    pub stream: String,
    pub events: Vec<Event>,
    pub is_replay: bool,
}

/// Live projection hook called after committed appends and republishes.
pub trait AppendListener: Send + Sync {
    fn on_append(&self, stream: &str, events: &[Event], is_replay: bool);
}

impl<F> AppendListener for F
where
    F: Fn(&str, &[Event], bool) + Send + Sync,
{
    fn on_append(&self, stream: &str, events: &[Event], is_replay: bool) {
        self(stream, events, is_replay)
    }
}

struct ChannelListener(mpsc::UnboundedSender<AppendNotice>);

impl AppendListener for ChannelListener {
    fn on_append(&self, stream: &str, events: &[Event], is_replay: bool) {
        // receiver dropped: nothing left to deliver to
        let _ = self.0.send(AppendNotice {
            stream: stream.to_string(),
            events: events.to_vec(),
            is_replay,
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<dyn AppendListener>)>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.read().len())
            .finish()
    }
}

impl Listeners {
    pub fn attach(&self, listener: Arc<dyn AppendListener>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));
        ListenerHandle(id)
    }

    pub fn detach(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.0);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls listeners in attachment order. The registry lock is released
    /// first so listeners may attach or detach.
    pub fn notify(&self, stream: &str, events: &[Event], is_replay: bool) {
        if events.is_empty() {
            return;
        }
        let snapshot: Vec<Arc<dyn AppendListener>> =
            self.entries.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in &snapshot {
            listener.on_append(stream, events, is_replay);
        }
        metrics::record_notifications(snapshot.len() as u64);
        tracing::debug!(target: "docket::events", stream, count = events.len(), is_replay, listeners = snapshot.len(), "notified append listeners");
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn has_stream(&self, stream: &str) -> Result<bool>;

    async fn create_stream(&self, stream: &str, kind: StreamKind) -> Result<()>;

    async fn delete_stream(&self, stream: &str) -> Result<()>;

    async fn stream_names(&self) -> Result<Vec<String>>;

    /// Appends `events`. With both `matcher` and `expected_version`, succeeds
    /// only if exactly `expected_version` stored events match.
    async fn append_to(
        &self,
        stream: &str,
        events: Vec<Event>,
        matcher: Option<&MetadataMatcher>,
        expected_version: Option<u64>,
    ) -> Result<()>;

    async fn load(&self, stream: &str, options: LoadOptions) -> Result<EventStream>;

    async fn delete(&self, stream: &str, matcher: &MetadataMatcher) -> Result<u64>;

    /// Re-delivers stored events to listeners as a replay. Returns how many were sent.
    async fn republish(&self, stream: &str, options: LoadOptions) -> Result<u64>;

    fn listeners(&self) -> &Listeners;

    async fn load_all(&self, stream: &str, options: LoadOptions) -> Result<Vec<Event>> {
        self.load(stream, options).await?.try_collect().await
    }

    fn attach_listener(&self, listener: Arc<dyn AppendListener>) -> ListenerHandle {
        self.listeners().attach(listener)
    }

    fn detach_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners().detach(handle)
    }

    fn subscribe(&self) -> (ListenerHandle, mpsc::UnboundedReceiver<AppendNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.listeners().attach(Arc::new(ChannelListener(tx)));
        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_event(id: &str, version: u64) -> Event {
        Event::new("OrderPlaced", json!({"id": id})).for_aggregate("Order", id, version)
    }

    #[test]
    fn matcher_requires_every_property() {
        let event = order_event("X", 1);
        assert!(match_event(&event, &MetadataMatcher::aggregate("Order", "X")));
        assert!(!match_event(&event, &MetadataMatcher::aggregate("Order", "Y")));
        assert!(!match_event(
            &event,
            &MetadataMatcher::new().eq("tenant", "acme")
        ));
    }

    #[test]
    fn matcher_supports_sets_ranges_and_aliases() {
        let event = order_event("X", 3);
        assert!(match_event(
            &event,
            &MetadataMatcher::new().eq_any("aggregateId", ["A", "X"])
        ));
        assert!(match_event(
            &event,
            &MetadataMatcher::new().gt("aggregateVersion", 2).lte("aggregateVersion", 3)
        ));
        assert!(!match_event(
            &event,
            &MetadataMatcher::new().lt("aggregateVersion", 3)
        ));
        assert!(match_event(
            &event,
            &MetadataMatcher::new().eq("name", "OrderPlaced")
        ));
        assert!(match_event(
            &event,
            &MetadataMatcher::new().eq("uuid", event.uuid.to_string())
        ));
    }

    #[test]
    fn select_excludes_cursor_and_limits_after_reverse() {
        let events: Vec<Event> = (1..=5).map(|v| order_event("X", v)).collect();
        let picked = select_events(
            &events,
            &LoadOptions::new().after(events[1].uuid).reverse().limit(2),
        );
        let versions: Vec<u64> = picked.iter().filter_map(Event::aggregate_version).collect();
        assert_eq!(versions, vec![5, 4]);
    }

    #[test]
    fn write_model_requires_aggregate_metadata() {
        let bare = Event::new("Noted", json!({}));
        assert!(validate_events("orders", StreamKind::WriteModel, &[bare.clone()]).is_err());
        assert!(validate_events("public", StreamKind::Unconstrained, &[bare]).is_ok());
    }

    #[test]
    fn listeners_fire_in_attachment_order_and_detach_by_handle() {
        let listeners = Listeners::default();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let a = seen.clone();
        let first = listeners.attach(Arc::new(move |_: &str, _: &[Event], _: bool| {
            a.lock().push("first")
        }));
        let b = seen.clone();
        listeners.attach(Arc::new(move |_: &str, _: &[Event], _: bool| {
            b.lock().push("second")
        }));
        listeners.notify("s", &[order_event("X", 1)], false);
        assert!(listeners.detach(first));
        assert!(!listeners.detach(first));
        listeners.notify("s", &[order_event("X", 2)], false);
        assert_eq!(*seen.lock(), vec!["first", "second", "second"]);
    }
}
