use std::sync::Arc;

use anyhow::Result;
use docket::{
    DocumentStore, Error, Event, EventStore, Filter, InMemoryMultiModelStore, LoadOptions,
    MetadataMatcher, MultiModelStore, Session, StreamKind,
    testing::{RecordingListener, order_event},
};
use serde_json::json;

async fn store_with_orders() -> Result<InMemoryMultiModelStore> {
    let store = InMemoryMultiModelStore::new();
    store
        .events()
        .create_stream("orders", StreamKind::WriteModel)
        .await?;
    store.documents().add_collection("orders").await?;
    store
        .documents()
        .add_doc("orders", "A", json!({"status": "open", "total": 5}))
        .await?;
    Ok(store)
}

/// Sessions that fail partway through replay, after at least one task applied.
fn failing_sessions() -> Result<Vec<(&'static str, Session)>> {
    let mut sessions = Vec::new();

    let mut duplicate_insert = Session::new();
    duplicate_insert.append_events("audit", vec![Event::new("Touched", json!({}))], None, None)?;
    duplicate_insert.update_doc("orders", "A", json!({"status": "paid"}))?;
    duplicate_insert.insert_doc("orders", "A", json!({}))?;
    sessions.push(("duplicate insert", duplicate_insert));

    let mut stale_append = Session::new();
    stale_append.insert_doc("orders", "B", json!({"status": "open"}))?;
    stale_append.append_events(
        "orders",
        vec![order_event("OrderPlaced", "A", 2)],
        Some(MetadataMatcher::aggregate("Order", "A")),
        Some(5),
    )?;
    sessions.push(("stale append", stale_append));

    let mut missing_collection = Session::new();
    missing_collection.delete_doc("orders", "A")?;
    missing_collection.delete_many("invoices", Filter::Any)?;
    sessions.push(("missing collection", missing_collection));

    let mut missing_doc = Session::new();
    missing_doc.upsert_doc("orders", "C", json!({"status": "new"}))?;
    missing_doc.replace_doc("orders", "nope", json!({}))?;
    sessions.push(("missing document", missing_doc));

    Ok(sessions)
}

#[tokio::test]
async fn failed_commit_leaves_both_stores_untouched() -> Result<()> {
    for (label, mut session) in failing_sessions()? {
        let store = store_with_orders().await?;
        store
            .events()
            .append_to(
                "orders",
                vec![order_event("OrderPlaced", "A", 1)],
                None,
                None,
            )
            .await?;
        let recorder = Arc::new(RecordingListener::new());
        store.events().attach_listener(recorder.clone());
        let events_before = store.event_store().export();
        let docs_before = store.document_store().export();

        let result = store.commit(&mut session).await;
        assert!(result.is_err(), "{label} should fail");
        assert_eq!(store.event_store().export(), events_before, "{label}");
        assert_eq!(store.document_store().export(), docs_before, "{label}");
        assert!(recorder.is_empty(), "{label} notified listeners");
        assert!(!store.event_store().is_suspended(), "{label}");
        assert!(matches!(
            session.insert_doc("orders", "Z", json!({})),
            Err(Error::SessionCommitted)
        ));
    }
    Ok(())
}

#[tokio::test]
async fn commit_rethrows_the_original_error() -> Result<()> {
    let store = store_with_orders().await?;
    let mut session = Session::new();
    session.append_events(
        "orders",
        vec![order_event("OrderPlaced", "A", 1)],
        Some(MetadataMatcher::aggregate("Order", "A")),
        Some(3),
    )?;
    match store.commit(&mut session).await {
        Err(Error::Concurrency {
            stream,
            expected,
            actual,
        }) => {
            assert_eq!(stream, "orders");
            assert_eq!((expected, actual), (3, 0));
        }
        other => panic!("expected concurrency error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn successful_commit_applies_categories_in_order() -> Result<()> {
    let store = store_with_orders().await?;
    let recorder = Arc::new(RecordingListener::new());
    store.events().attach_listener(recorder.clone());

    let mut session = Session::new();
    // registered out of replay order on purpose
    session.delete_many("orders", Filter::eq("status", "cancelled"))?;
    session.update_many("orders", Filter::Any, json!({"checked": true}))?;
    session.insert_doc("orders", "B", json!({"status": "cancelled"}))?;
    session.insert_doc("orders", "C", json!({"status": "open"}))?;
    session.append_events(
        "orders",
        vec![order_event("OrderPlaced", "B", 1)],
        Some(MetadataMatcher::aggregate("Order", "B")),
        Some(0),
    )?;
    store.commit(&mut session).await?;

    let docs = store
        .documents()
        .find_docs("orders", &Filter::Any, &Default::default())
        .await?;
    assert_eq!(
        docs,
        vec![
            (
                "A".to_string(),
                json!({"status": "open", "total": 5, "checked": true})
            ),
            ("C".to_string(), json!({"status": "open", "checked": true})),
        ]
    );
    assert_eq!(
        store
            .events()
            .load_all("orders", LoadOptions::new())
            .await?
            .len(),
        1
    );
    assert_eq!(recorder.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_sessions_rely_on_the_stream_check() -> Result<()> {
    let store = Arc::new(store_with_orders().await?);
    let matcher = MetadataMatcher::aggregate("Order", "X");

    let mut handles = Vec::new();
    for writer in 0..4 {
        let store = store.clone();
        let matcher = matcher.clone();
        handles.push(tokio::spawn(async move {
            let mut session = Session::new();
            session.append_events(
                "orders",
                vec![order_event("OrderPlaced", "X", 1).with_meta("writer", writer)],
                Some(matcher),
                Some(0),
            )?;
            store.commit(&mut session).await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => committed += 1,
            Err(err) => assert!(err.is_concurrency(), "{err}"),
        }
    }
    assert_eq!(committed, 1);
    Ok(())
}
