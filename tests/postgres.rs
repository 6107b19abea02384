use std::sync::Arc;

use anyhow::Result;
use docket::{
    DocumentStore, Error, Event, EventStore, Filter, FindOptions, LoadOptions, MetadataMatcher,
    SortDirection, Store, StreamKind,
    testing::{RecordingListener, isolated_store, order_event},
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

async fn postgres() -> Result<(ContainerAsync<GenericImage>, String)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");
    Ok((container, url))
}

#[tokio::test]
#[ignore = "requires docker"]
async fn migrate_is_idempotent_and_schemas_are_isolated() -> Result<()> {
    let (_container, url) = postgres().await?;
    let store = Store::builder(&url).schema("tenant_a").migrate(true).build().await?;
    assert!(store.schema().plan().await?.is_empty());

    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
    let other = isolated_store(pool, "tenant_b").await?;

    store.documents().add_collection("orders").await?;
    assert_eq!(store.documents().collection_names().await?, vec!["orders"]);
    assert!(other.documents().collection_names().await?.is_empty());

    let health = store.pool_health().await?;
    assert!(health.ok);
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn event_store_appends_loads_and_rejects_stale_writers() -> Result<()> {
    let (_container, url) = postgres().await?;
    let store = Store::builder(&url).migrate(true).build().await?;
    let events = store.events();
    events.create_stream("orders", StreamKind::WriteModel).await?;
    let matcher = MetadataMatcher::aggregate("Order", "X");

    events
        .append_to(
            "orders",
            vec![order_event("OrderPlaced", "X", 1), order_event("OrderPaid", "X", 2)],
            Some(&matcher),
            Some(0),
        )
        .await?;
    let stale = events
        .append_to(
            "orders",
            vec![order_event("OrderPaid", "X", 2)],
            Some(&matcher),
            Some(1),
        )
        .await;
    match stale {
        Err(Error::Concurrency {
            expected, actual, ..
        }) => assert_eq!((expected, actual), (1, 2)),
        other => panic!("expected concurrency error, got {other:?}"),
    }

    // an explicit version collision without expected_version trips the unique index
    let collision = events
        .append_to("orders", vec![order_event("OrderPaid", "X", 2)], None, None)
        .await;
    assert!(collision.unwrap_err().is_concurrency());

    let loaded = events.load_all("orders", LoadOptions::new()).await?;
    assert_eq!(
        loaded.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["OrderPlaced", "OrderPaid"]
    );
    let after = events
        .load_all("orders", LoadOptions::new().after(loaded[0].uuid))
        .await?;
    assert_eq!(after.len(), 1);
    let newest = events
        .load_all("orders", LoadOptions::new().reverse().limit(1))
        .await?;
    assert_eq!(newest[0].name, "OrderPaid");

    let recorder = Arc::new(RecordingListener::new());
    events.attach_listener(recorder.clone());
    assert_eq!(events.republish("orders", LoadOptions::new()).await?, 2);
    assert!(recorder.notices()[0].is_replay);

    assert_eq!(
        events
            .delete("orders", &MetadataMatcher::new().eq("aggregateVersion", 2))
            .await?,
        1
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn document_filters_match_the_in_memory_semantics() -> Result<()> {
    let (_container, url) = postgres().await?;
    let store = Store::builder(&url).migrate(true).build().await?;
    let documents = store.documents();
    documents.add_collection("customers").await?;
    documents
        .add_doc("customers", "c1", json!({"name": "Ada", "tier": "gold", "age": 36, "tags": ["vip"]}))
        .await?;
    documents
        .add_doc("customers", "c2", json!({"name": "Alan", "tier": "silver", "age": 41, "tags": []}))
        .await?;
    documents
        .add_doc("customers", "c3", json!({"name": "Grace", "tier": "gold", "age": 85}))
        .await?;

    let cases = vec![
        (Filter::eq("tier", "gold"), vec!["c1", "c3"]),
        (Filter::gt("age", 40), vec!["c2", "c3"]),
        (Filter::like("name", "a%"), vec!["c1", "c2"]),
        (Filter::exists("tags"), vec!["c1", "c2"]),
        (Filter::in_array("tags", "vip"), vec!["c1"]),
        (Filter::any_of_doc_id(["c3", "zz"]), vec!["c3"]),
        (Filter::negate(Filter::eq("tier", "gold")), vec!["c2"]),
        (Filter::or(vec![]), vec![]),
        (Filter::negate(Filter::eq("nickname", "x")), vec!["c1", "c2", "c3"]),
        (Filter::negate(Filter::gt("nickname", 0)), vec!["c1", "c2", "c3"]),
        (Filter::negate(Filter::like("nickname", "x%")), vec!["c1", "c2", "c3"]),
        (Filter::negate(Filter::in_array("tags", "vip")), vec!["c2", "c3"]),
        (Filter::negate(Filter::exists("address.city")), vec!["c1", "c2", "c3"]),
        (Filter::lt("name", "a"), vec!["c1", "c2", "c3"]),
        (Filter::gt("age", 9_007_199_254_740_992_i64), vec![]),
    ];
    for (filter, expected) in cases {
        assert_eq!(
            documents.find_doc_ids("customers", &filter).await?,
            expected,
            "{filter:?}"
        );
    }

    let oldest = documents
        .find_docs(
            "customers",
            &Filter::Any,
            &FindOptions::new().order_by("age", SortDirection::Desc).limit(1),
        )
        .await?;
    assert_eq!(oldest[0].0, "c3");

    documents.add_collection("labels").await?;
    documents.add_doc("labels", "l1", json!({"label": "a"})).await?;
    documents.add_doc("labels", "l2", json!({"label": "B"})).await?;
    documents.add_doc("labels", "l3", json!({"label": 3})).await?;
    documents.add_doc("labels", "l4", json!({})).await?;
    let sorted = documents
        .find_docs(
            "labels",
            &Filter::Any,
            &FindOptions::new().order_by("label", SortDirection::Asc),
        )
        .await?;
    assert_eq!(
        sorted.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
        vec!["l2", "l1", "l3", "l4"]
    );
    assert_eq!(
        documents.find_doc_ids("labels", &Filter::gt("label", "Z")).await?,
        vec!["l1", "l3"]
    );

    assert_eq!(
        documents
            .update_many("customers", &Filter::eq("tier", "gold"), json!({"discount": 5}))
            .await?,
        2
    );
    assert!(matches!(
        documents.add_doc("customers", "c1", json!({})).await,
        Err(Error::DocumentExists { .. })
    ));
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn session_commit_is_atomic_and_notifies_after_commit() -> Result<()> {
    let (_container, url) = postgres().await?;
    let store = Store::builder(&url).migrate(true).build().await?;
    store.events().create_stream("orders", StreamKind::WriteModel).await?;
    store.documents().add_collection("orders").await?;
    let recorder = Arc::new(RecordingListener::new());
    store.events().attach_listener(recorder.clone());

    let mut failing = store.session();
    failing.append_events("orders", vec![order_event("OrderPlaced", "A", 1)], None, None)?;
    failing.insert_doc("orders", "A", json!({"status": "open"}))?;
    failing.update_doc("orders", "missing", json!({"status": "paid"}))?;
    assert!(matches!(
        store.commit(&mut failing).await,
        Err(Error::NotFound(_))
    ));
    assert!(store.events().load_all("orders", LoadOptions::new()).await?.is_empty());
    assert_eq!(store.documents().get_doc("orders", "A").await?, None);
    assert!(recorder.is_empty());

    let mut session = store.session();
    session.append_events(
        "orders",
        vec![order_event("OrderPlaced", "A", 1)],
        Some(MetadataMatcher::aggregate("Order", "A")),
        Some(0),
    )?;
    session.insert_doc("orders", "A", json!({"status": "open"}))?;
    session.update_doc("orders", "A", json!({"status": "placed"}))?;
    store.commit(&mut session).await?;

    assert_eq!(
        store.documents().get_doc("orders", "A").await?,
        Some(json!({"status": "placed"}))
    );
    let notices = recorder.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].stream, "orders");
    assert!(!notices[0].is_replay);
    assert!(matches!(
        session.append_events("orders", vec![Event::new("Late", json!({}))], None, None),
        Err(Error::SessionCommitted)
    ));
    Ok(())
}
