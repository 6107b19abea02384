use anyhow::Result;
use docket::{
    DocumentStore, Error, Filter, FindOptions, PartialSelect, SortDirection,
    documents::memory::InMemoryDocumentStore,
};
use serde_json::{Value, json};

async fn customers() -> Result<InMemoryDocumentStore> {
    let store = InMemoryDocumentStore::new();
    store.add_collection("customers").await?;
    let rows = [
        ("c1", json!({"name": "Ada Lovelace", "tier": "gold", "age": 36, "tags": ["vip", "math"], "address": {"city": "London"}})),
        ("c2", json!({"name": "Alan Turing", "tier": "silver", "age": 41, "tags": ["math"], "address": {"city": "Wilmslow"}})),
        ("c3", json!({"name": "Grace Hopper", "tier": "gold", "age": 85, "tags": [], "address": {"city": "Arlington"}})),
        ("c4", json!({"name": "Edsger Dijkstra", "tier": "bronze", "age": 72})),
    ];
    for (id, doc) in rows {
        store.add_doc("customers", id, doc).await?;
    }
    Ok(store)
}

fn ids(found: &[(String, Value)]) -> Vec<&str> {
    found.iter().map(|(id, _)| id.as_str()).collect()
}

#[tokio::test]
async fn filters_select_expected_documents() -> Result<()> {
    let store = customers().await?;
    let cases = vec![
        (Filter::eq("tier", "gold"), vec!["c1", "c3"]),
        (Filter::gte("age", 41), vec!["c2", "c3", "c4"]),
        (Filter::lt("age", 40), vec!["c1"]),
        (Filter::like("name", "%TUR%"), vec!["c2"]),
        (Filter::exists("address.city"), vec!["c1", "c2", "c3"]),
        (Filter::in_array("tags", "math"), vec!["c1", "c2"]),
        (Filter::any_of("tier", ["silver", "bronze"]), vec!["c2", "c4"]),
        (Filter::any_of_doc_id(["c4", "c1", "zz"]), vec!["c1", "c4"]),
        (
            Filter::and(vec![
                Filter::eq("tier", "gold"),
                Filter::negate(Filter::eq("address.city", "London")),
            ]),
            vec!["c3"],
        ),
        (
            Filter::or(vec![Filter::doc_id("c2"), Filter::gt("age", 80)]),
            vec!["c2", "c3"],
        ),
        (Filter::and(vec![]), vec!["c1", "c2", "c3", "c4"]),
        (Filter::or(vec![]), vec![]),
    ];
    for (filter, expected) in cases {
        let found = store
            .find_docs("customers", &filter, &FindOptions::new())
            .await?;
        assert_eq!(ids(&found), expected, "{filter:?}");
        assert_eq!(
            store.count_docs("customers", &filter).await?,
            expected.len() as u64
        );
    }
    Ok(())
}

#[tokio::test]
async fn negation_over_missing_paths_selects_the_document() -> Result<()> {
    let store = customers().await?;
    let everyone = vec!["c1", "c2", "c3", "c4"];
    let cases = vec![
        (Filter::negate(Filter::eq("nickname", "x")), everyone.clone()),
        (Filter::negate(Filter::gt("nickname", 0)), everyone.clone()),
        (Filter::negate(Filter::like("nickname", "x%")), everyone.clone()),
        (Filter::negate(Filter::any_of("nickname", ["x"])), everyone.clone()),
        (Filter::negate(Filter::in_array("tags", "vip")), vec!["c2", "c3", "c4"]),
        (Filter::negate(Filter::exists("address.city")), vec!["c4"]),
        (Filter::negate(Filter::exists("contact.email")), everyone.clone()),
    ];
    for (filter, expected) in cases {
        assert_eq!(
            store.find_doc_ids("customers", &filter).await?,
            expected,
            "{filter:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn strings_compare_and_sort_bytewise() -> Result<()> {
    let store = customers().await?;
    // uppercase sorts before lowercase
    assert_eq!(
        store.find_doc_ids("customers", &Filter::lt("name", "a")).await?,
        vec!["c1", "c2", "c3", "c4"]
    );

    store.add_collection("labels").await?;
    store.add_doc("labels", "l1", json!({"label": "a"})).await?;
    store.add_doc("labels", "l2", json!({"label": "B"})).await?;
    store.add_doc("labels", "l3", json!({"label": 3})).await?;
    store.add_doc("labels", "l4", json!({})).await?;

    let sorted = store
        .find_docs(
            "labels",
            &Filter::Any,
            &FindOptions::new().order_by("label", SortDirection::Asc),
        )
        .await?;
    assert_eq!(ids(&sorted), vec!["l2", "l1", "l3", "l4"]);
    // numbers rank above every string
    assert_eq!(
        store.find_doc_ids("labels", &Filter::gt("label", "Z")).await?,
        vec!["l1", "l3"]
    );
    Ok(())
}

#[tokio::test]
async fn filters_cross_the_query_boundary_as_json() -> Result<()> {
    let store = customers().await?;
    let filter: Filter = serde_json::from_value(json!({
        "kind": "and",
        "filters": [
            {"kind": "eq", "prop": "tier", "value": "gold"},
            {"kind": "gt", "prop": "age", "value": 50}
        ]
    }))?;
    assert_eq!(store.find_doc_ids("customers", &filter).await?, vec!["c3"]);
    Ok(())
}

#[tokio::test]
async fn ordering_pagination_and_projection() -> Result<()> {
    let store = customers().await?;
    let options = FindOptions::new()
        .order_by("tier", SortDirection::Asc)
        .order_by("age", SortDirection::Desc)
        .skip(1)
        .limit(2);
    let found = store.find_docs("customers", &Filter::Any, &options).await?;
    // bronze(c4), gold(c3 85, c1 36), silver(c2)
    assert_eq!(ids(&found), vec!["c3", "c1"]);

    let select = PartialSelect::new()
        .field("who", "name")
        .field("city", "address.city");
    let partial = store
        .find_partial_docs(
            "customers",
            &select,
            &Filter::eq("tier", "bronze"),
            &FindOptions::new(),
        )
        .await?;
    assert_eq!(
        partial,
        vec![("c4".to_string(), json!({"who": "Edsger Dijkstra", "city": null}))]
    );
    assert_eq!(
        store.get_partial_doc("customers", "c1", &select).await?,
        Some(json!({"who": "Ada Lovelace", "city": "London"}))
    );
    Ok(())
}

#[tokio::test]
async fn bulk_writes_report_affected_counts() -> Result<()> {
    let store = customers().await?;
    let gold = Filter::eq("tier", "gold");

    assert_eq!(
        store
            .update_many("customers", &gold, json!({"discount": 10}))
            .await?,
        2
    );
    assert_eq!(
        store.get_doc("customers", "c3").await?.unwrap()["discount"],
        json!(10)
    );

    assert_eq!(
        store
            .replace_many("customers", &Filter::doc_id("c4"), json!({"name": "E.W.D."}))
            .await?,
        1
    );
    assert_eq!(
        store.get_doc("customers", "c4").await?,
        Some(json!({"name": "E.W.D."}))
    );

    assert_eq!(store.delete_many("customers", &gold).await?, 2);
    assert_eq!(store.count_docs("customers", &Filter::Any).await?, 2);
    Ok(())
}

#[tokio::test]
async fn single_document_errors() -> Result<()> {
    let store = customers().await?;
    assert!(matches!(
        store.add_doc("customers", "c1", json!({})).await,
        Err(Error::DocumentExists { .. })
    ));
    assert!(matches!(
        store.update_doc("customers", "nope", json!({"a": 1})).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.add_doc("customers", "c9", json!([1, 2])).await,
        Err(Error::InvalidDocument(_))
    ));
    assert!(matches!(
        store.get_doc("missing", "c1").await,
        Err(Error::CollectionNotFound(_))
    ));

    store.delete_doc("customers", "nope").await?;
    store
        .upsert_doc("customers", "c9", json!({"name": "New"}))
        .await?;
    store
        .update_doc("customers", "c9", json!({"tier": "gold"}))
        .await?;
    assert_eq!(
        store.get_doc("customers", "c9").await?,
        Some(json!({"name": "New", "tier": "gold"}))
    );
    Ok(())
}
