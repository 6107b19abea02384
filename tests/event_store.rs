use std::sync::Arc;

use anyhow::Result;
use docket::{
    Error, Event, EventStore, LoadOptions, MetadataMatcher, StreamKind,
    events::memory::InMemoryEventStore,
    testing::{RecordingListener, order_event},
};
use serde_json::json;

fn names(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.name.clone()).collect()
}

async fn seeded() -> Result<(InMemoryEventStore, Vec<Event>)> {
    let store = InMemoryEventStore::new();
    let events: Vec<Event> = (0..5)
        .map(|i| Event::new(format!("E{i}"), json!({ "i": i })).with_meta("tenant", if i % 2 == 0 { "a" } else { "b" }))
        .collect();
    store.append_to("log", events.clone(), None, None).await?;
    Ok((store, events))
}

#[tokio::test]
async fn orders_write_model_rejects_second_writer() -> Result<()> {
    let store = InMemoryEventStore::new();
    store.create_stream("orders", StreamKind::WriteModel).await?;
    let matcher = MetadataMatcher::aggregate("Order", "X");

    store
        .append_to(
            "orders",
            vec![order_event("OrderPlaced", "X", 1)],
            Some(&matcher),
            Some(0),
        )
        .await?;

    let err = store
        .append_to(
            "orders",
            vec![order_event("OrderPlaced", "X", 1)],
            Some(&matcher),
            Some(0),
        )
        .await
        .unwrap_err();
    match err {
        Error::Concurrency {
            stream,
            expected,
            actual,
        } => {
            assert_eq!(stream, "orders");
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected concurrency error, got {other:?}"),
    }
    assert_eq!(store.load_all("orders", LoadOptions::new()).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn expected_version_counts_only_matching_events() -> Result<()> {
    let (store, _) = seeded().await?;
    let tenant_a = MetadataMatcher::new().eq("tenant", "a");

    let stale = store
        .append_to("log", vec![Event::new("Late", json!({}))], Some(&tenant_a), Some(2))
        .await;
    assert!(stale.unwrap_err().is_concurrency());

    store
        .append_to(
            "log",
            vec![Event::new("OnTime", json!({})).with_meta("tenant", "a")],
            Some(&tenant_a),
            Some(3),
        )
        .await?;
    let loaded = store
        .load_all("log", LoadOptions::new().matching(tenant_a))
        .await?;
    assert_eq!(names(&loaded), vec!["E0", "E2", "E4", "OnTime"]);
    Ok(())
}

#[tokio::test]
async fn load_cursor_excludes_anchor_and_reverses_before_limit() -> Result<()> {
    let (store, events) = seeded().await?;

    let after = store
        .load_all("log", LoadOptions::new().after(events[1].uuid))
        .await?;
    assert_eq!(names(&after), vec!["E2", "E3", "E4"]);

    let newest = store
        .load_all("log", LoadOptions::new().reverse().limit(2))
        .await?;
    assert_eq!(names(&newest), vec!["E4", "E3"]);

    let unknown = store
        .load_all("log", LoadOptions::new().after(uuid::Uuid::new_v4()))
        .await?;
    assert!(unknown.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_removes_exactly_the_matching_events() -> Result<()> {
    let (store, _) = seeded().await?;
    let tenant_b = MetadataMatcher::new().eq("tenant", "b");

    assert_eq!(store.delete("log", &tenant_b).await?, 2);
    assert!(
        store
            .load_all("log", LoadOptions::new().matching(tenant_b.clone()))
            .await?
            .is_empty()
    );
    assert_eq!(store.load_all("log", LoadOptions::new()).await?.len(), 3);
    assert_eq!(store.delete("log", &tenant_b).await?, 0);
    Ok(())
}

#[tokio::test]
async fn range_and_membership_matchers() -> Result<()> {
    let store = InMemoryEventStore::new();
    let events: Vec<Event> = (1..=4).map(|v| order_event("Step", "A", v)).collect();
    store.append_to("orders", events, None, None).await?;

    let middle = MetadataMatcher::aggregate("Order", "A")
        .gt("aggregateVersion", 1)
        .lte("aggregateVersion", 3);
    assert_eq!(
        store
            .load_all("orders", LoadOptions::new().matching(middle))
            .await?
            .iter()
            .map(|e| e.aggregate_version())
            .collect::<Vec<_>>(),
        vec![Some(2), Some(3)]
    );

    let picked = MetadataMatcher::new().eq_any("aggregateVersion", [1, 4]);
    assert_eq!(
        store
            .load_all("orders", LoadOptions::new().matching(picked))
            .await?
            .len(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn listeners_fire_in_attachment_order_and_detach_by_handle() -> Result<()> {
    let store = InMemoryEventStore::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let first = {
        let order = order.clone();
        store.attach_listener(Arc::new(move |_: &str, _: &[Event], _: bool| {
            order.lock().push("first")
        }))
    };
    {
        let order = order.clone();
        store.attach_listener(Arc::new(move |_: &str, _: &[Event], _: bool| {
            order.lock().push("second")
        }));
    }

    store
        .append_to("log", vec![Event::new("A", json!({}))], None, None)
        .await?;
    assert_eq!(*order.lock(), vec!["first", "second"]);

    assert!(store.detach_listener(first));
    assert!(!store.detach_listener(first));
    store
        .append_to("log", vec![Event::new("B", json!({}))], None, None)
        .await?;
    assert_eq!(*order.lock(), vec!["first", "second", "second"]);
    Ok(())
}

#[tokio::test]
async fn republish_replays_to_listeners() -> Result<()> {
    let (store, events) = seeded().await?;
    let recorder = Arc::new(RecordingListener::new());
    store.attach_listener(recorder.clone());

    let sent = store
        .republish("log", LoadOptions::new().after(events[2].uuid))
        .await?;
    assert_eq!(sent, 2);
    let notices = recorder.notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].is_replay);
    assert_eq!(names(&notices[0].events), vec!["E3", "E4"]);

    let missing = store.republish("nope", LoadOptions::new()).await;
    assert!(matches!(missing, Err(Error::StreamNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn stream_lifecycle() -> Result<()> {
    let store = InMemoryEventStore::new();
    assert!(!store.has_stream("orders").await?);
    store.create_stream("orders", StreamKind::WriteModel).await?;
    assert!(matches!(
        store.create_stream("orders", StreamKind::Unconstrained).await,
        Err(Error::StreamExists(_))
    ));

    let missing_aggregate = store
        .append_to("orders", vec![Event::new("Bare", json!({}))], None, None)
        .await;
    assert!(matches!(missing_aggregate, Err(Error::InvalidEvent(_))));

    store.delete_stream("orders").await?;
    assert!(store.stream_names().await?.is_empty());
    assert!(matches!(
        store.delete_stream("orders").await,
        Err(Error::StreamNotFound(_))
    ));
    Ok(())
}
