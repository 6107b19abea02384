//! Relational event store: a registry table plus one table per stream.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Map as JsonMap, Value};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, types::Json};
use uuid::Uuid;

use super::{
    Comparison, Event, EventStore, EventStream, Listeners, LoadOptions, MetadataMatcher,
    StreamKind, validate_events, version_taken,
};
use crate::{
    Error, Result, metrics,
    schema::{self, STREAMS_TABLE, qualified_name, quote_literal},
};

const PAGE_SIZE: usize = 500;

type EventRow = (
    i64,
    Uuid,
    String,
    Json<Value>,
    Json<JsonMap<String, Value>>,
    DateTime<Utc>,
);

fn row_to_event(row: EventRow) -> (i64, Event) {
    let (no, uuid, name, payload, meta, created_at) = row;
    (
        no,
        Event {
            uuid,
            name,
            payload: payload.0,
            meta: meta.0,
            created_at,
        },
    )
}

#[derive(Clone, Debug)]
pub(crate) struct StreamTable {
    pub qualified: String,
    pub kind: StreamKind,
}

/// Serializes writers to one stream until the surrounding transaction ends.
pub(crate) async fn lock_stream(conn: &mut PgConnection, stream: &str) -> Result<()> {
    sqlx::query("select pg_advisory_xact_lock(hashtext($1)::bigint)")
        .bind(stream)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn resolve_stream(
    conn: &mut PgConnection,
    schema_name: &str,
    stream: &str,
) -> Result<Option<StreamTable>> {
    let row = sqlx::query_as::<_, (String, String)>(&format!(
        "select table_name, kind from {} where name = $1",
        qualified_name(schema_name, STREAMS_TABLE)
    ))
    .bind(stream)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|(table, kind)| {
        let kind = StreamKind::parse(&kind).ok_or_else(|| {
            Error::InvalidEvent(format!("stream `{stream}` has unknown kind `{kind}`"))
        })?;
        Ok(StreamTable {
            qualified: qualified_name(schema_name, &table),
            kind,
        })
    })
    .transpose()
}

/// Registers and creates a stream table. Returns `false` if it was already registered.
pub(crate) async fn register_stream(
    conn: &mut PgConnection,
    schema_name: &str,
    stream: &str,
    kind: StreamKind,
) -> Result<bool> {
    let table = schema::stream_table(stream);
    let inserted = sqlx::query_scalar::<_, String>(&format!(
        "insert into {} (name, table_name, kind) values ($1, $2, $3) on conflict (name) do nothing returning name",
        qualified_name(schema_name, STREAMS_TABLE)
    ))
    .bind(stream)
    .bind(&table)
    .bind(kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_none() {
        return Ok(false);
    }
    for statement in schema::build_stream_table_sql(schema_name, &table, kind) {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    tracing::debug!(target: "docket::events", stream, table = %table, kind = kind.as_str(), "created stream table");
    Ok(true)
}

/// Looks a stream up, creating an unconstrained one when it was never created.
pub(crate) async fn ensure_stream(
    conn: &mut PgConnection,
    schema_name: &str,
    stream: &str,
) -> Result<StreamTable> {
    if let Some(table) = resolve_stream(conn, schema_name, stream).await? {
        return Ok(table);
    }
    register_stream(conn, schema_name, stream, StreamKind::Unconstrained).await?;
    resolve_stream(conn, schema_name, stream)
        .await?
        .ok_or_else(|| Error::StreamNotFound(stream.to_string()))
}

fn property_expr(property: &str) -> String {
    match property {
        "uuid" => "to_jsonb(uuid::text)".to_string(),
        "name" => "to_jsonb(name)".to_string(),
        "createdAt" => {
            r#"to_jsonb(to_char(created_at at time zone 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'))"#
                .to_string()
        }
        other => format!("meta->{}", quote_literal(other)),
    }
}

pub(crate) fn push_matcher(qb: &mut QueryBuilder<'_, Postgres>, matcher: &MetadataMatcher) {
    qb.push("true");
    for (property, comparison) in matcher.iter() {
        let expr = property_expr(property);
        let (op, value) = match comparison {
            Comparison::EqAny(values) => {
                qb.push(format!(" and {expr} in (select jsonb_array_elements("));
                qb.push_bind(Json(Value::Array(values.clone())));
                qb.push("::jsonb))");
                continue;
            }
            Comparison::Eq(v) => ("=", v),
            Comparison::Gt(v) => (">", v),
            Comparison::Gte(v) => (">=", v),
            Comparison::Lt(v) => ("<", v),
            Comparison::Lte(v) => ("<=", v),
        };
        match value {
            Value::String(text) if op != "=" => {
                qb.push(format!(
                    " and case when jsonb_typeof({expr}) = 'string' then ({expr} #>> '{{}}') collate \"C\" {op} "
                ));
                qb.push_bind(text.clone());
                qb.push(format!(" else {expr} {op} "));
                qb.push_bind(Json(value.clone()));
                qb.push("::jsonb end");
            }
            _ => {
                qb.push(format!(" and {expr} {op} "));
                qb.push_bind(Json(value.clone()));
                qb.push("::jsonb");
            }
        }
    }
}

async fn count_matching(
    conn: &mut PgConnection,
    table: &StreamTable,
    matcher: &MetadataMatcher,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "select count(*) from {} where ",
        table.qualified
    ));
    push_matcher(&mut qb, matcher);
    let count: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(count as u64)
}

fn translate_insert_error(err: sqlx::Error, stream: &str, event: &Event) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            let constraint = db_err.constraint().unwrap_or_default();
            if constraint.ends_with("_uuid_key") {
                return Error::InvalidEvent(format!(
                    "event {} already exists in `{stream}`",
                    event.uuid
                ));
            }
            if constraint.ends_with("_aggregate_version_key") {
                metrics::record_event_conflict();
                return version_taken(stream, event.aggregate_version().unwrap_or_default());
            }
        }
    }
    err.into()
}

/// Appends within the caller's transaction: lock, count, insert.
pub(crate) async fn append_in(
    conn: &mut PgConnection,
    schema_name: &str,
    stream: &str,
    events: &[Event],
    matcher: Option<&MetadataMatcher>,
    expected_version: Option<u64>,
) -> Result<()> {
    lock_stream(conn, stream).await?;
    let table = ensure_stream(conn, schema_name, stream).await?;
    validate_events(stream, table.kind, events)?;

    if let (Some(matcher), Some(expected)) = (matcher, expected_version) {
        let actual = count_matching(conn, &table, matcher).await?;
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

    let insert = format!(
        "insert into {} (uuid, name, payload, meta, created_at) values ($1, $2, $3::json, $4, $5)",
        table.qualified
    );
    for event in events {
        sqlx::query(&insert)
            .bind(event.uuid)
            .bind(&event.name)
            .bind(Json(&event.payload))
            .bind(Json(&event.meta))
            .bind(event.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| translate_insert_error(e, stream, event))?;
    }
    Ok(())
}

pub(crate) async fn delete_in(
    conn: &mut PgConnection,
    schema_name: &str,
    stream: &str,
    matcher: &MetadataMatcher,
) -> Result<u64> {
    lock_stream(conn, stream).await?;
    let table = resolve_stream(conn, schema_name, stream)
        .await?
        .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
    let mut qb = QueryBuilder::<Postgres>::new(format!("delete from {} where ", table.qualified));
    push_matcher(&mut qb, matcher);
    let removed = qb.build().execute(&mut *conn).await?.rows_affected();
    Ok(removed)
}

async fn cursor_position(
    conn: &mut PgConnection,
    table: &StreamTable,
    event_id: Uuid,
) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar::<_, i64>(&format!("select no from {} where uuid = $1", table.qualified))
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

struct PageQuery<'a> {
    table: &'a StreamTable,
    matcher: Option<&'a MetadataMatcher>,
    after: Option<i64>,
    keyset: Option<i64>,
    reverse: bool,
    size: usize,
}

async fn fetch_page(pool: &PgPool, page: PageQuery<'_>) -> Result<Vec<(i64, Event)>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "select no, uuid, name, payload, meta, created_at from {} where ",
        page.table.qualified
    ));
    match page.matcher {
        Some(matcher) => push_matcher(&mut qb, matcher),
        None => {
            qb.push("true");
        }
    }
    if let Some(after) = page.after {
        qb.push(" and no > ").push_bind(after);
    }
    if let Some(keyset) = page.keyset {
        qb.push(if page.reverse { " and no < " } else { " and no > " })
            .push_bind(keyset);
    }
    qb.push(if page.reverse {
        " order by no desc"
    } else {
        " order by no asc"
    });
    qb.push(" limit ").push_bind(page.size as i64);
    let rows: Vec<EventRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(row_to_event).collect())
}

/// Pages through a stream table lazily, keyed on `no`.
fn paged_events(
    pool: PgPool,
    table: StreamTable,
    options: LoadOptions,
    after: Option<i64>,
) -> impl Stream<Item = Result<Event>> + Send + 'static {
    try_stream! {
        let mut keyset = None;
        let mut remaining = options.limit;
        loop {
            let size = remaining.map_or(PAGE_SIZE, |r| r.min(PAGE_SIZE));
            if size == 0 {
                break;
            }
            let rows = fetch_page(&pool, PageQuery {
                table: &table,
                matcher: options.matcher.as_ref(),
                after,
                keyset,
                reverse: options.reverse,
                size,
            })
            .await?;
            let fetched = rows.len();
            for (no, event) in rows {
                keyset = Some(no);
                yield event;
            }
            if let Some(r) = remaining.as_mut() {
                *r -= fetched;
            }
            if fetched < size {
                break;
            }
        }
    }
}

pub struct PgEventStore {
    pool: PgPool,
    schema: String,
    listeners: Listeners,
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("schema", &self.schema)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl PgEventStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            listeners: Listeners::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn has_stream(&self, stream: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(resolve_stream(&mut conn, &self.schema, stream)
            .await?
            .is_some())
    }

    async fn create_stream(&self, stream: &str, kind: StreamKind) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_stream(&mut tx, stream).await?;
        if !register_stream(&mut tx, &self.schema, stream, kind).await? {
            return Err(Error::StreamExists(stream.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_stream(&mut tx, stream).await?;
        let table = sqlx::query_scalar::<_, String>(&format!(
            "delete from {} where name = $1 returning table_name",
            qualified_name(&self.schema, STREAMS_TABLE)
        ))
        .bind(stream)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        sqlx::query(&format!(
            "drop table if exists {}",
            qualified_name(&self.schema, &table)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(target: "docket::events", stream, "deleted stream");
        Ok(())
    }

    async fn stream_names(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(&format!(
            "select name from {} order by name",
            qualified_name(&self.schema, STREAMS_TABLE)
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn append_to(
        &self,
        stream: &str,
        events: Vec<Event>,
        matcher: Option<&MetadataMatcher>,
        expected_version: Option<u64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        append_in(
            &mut tx,
            &self.schema,
            stream,
            &events,
            matcher,
            expected_version,
        )
        .await?;
        tx.commit().await?;
        if events.is_empty() {
            return Ok(());
        }
        metrics::record_event_appends(events.len() as u64);
        tracing::debug!(target: "docket::events", stream, count = events.len(), "appended events");
        self.listeners.notify(stream, &events, false);
        Ok(())
    }

    async fn load(&self, stream: &str, options: LoadOptions) -> Result<EventStream> {
        let (table, after) = {
            let mut tx = self.pool.begin().await?;
            let table = match resolve_stream(&mut tx, &self.schema, stream).await? {
                Some(table) => table,
                None => {
                    lock_stream(&mut tx, stream).await?;
                    ensure_stream(&mut tx, &self.schema, stream).await?
                }
            };
            let after = match options.from_event_id {
                Some(id) => match cursor_position(&mut tx, &table, id).await? {
                    Some(no) => Some(no),
                    None => {
                        tx.commit().await?;
                        return Ok(Box::pin(futures::stream::empty()));
                    }
                },
                None => None,
            };
            tx.commit().await?;
            (table, after)
        };

        Ok(Box::pin(paged_events(self.pool.clone(), table, options, after)))
    }

    async fn delete(&self, stream: &str, matcher: &MetadataMatcher) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_in(&mut tx, &self.schema, stream, matcher).await?;
        tx.commit().await?;
        if removed > 0 {
            metrics::record_event_deletes(removed);
        }
        tracing::debug!(target: "docket::events", stream, removed, "deleted events");
        Ok(removed)
    }

    async fn republish(&self, stream: &str, options: LoadOptions) -> Result<u64> {
        if !self.has_stream(stream).await? {
            return Err(Error::StreamNotFound(stream.to_string()));
        }
        let events = self.load_all(stream, options).await?;
        self.listeners.notify(stream, &events, true);
        Ok(events.len() as u64)
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}
