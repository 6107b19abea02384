//! Relational document store: one `(id text, doc jsonb)` table per collection.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Arguments, PgConnection, PgPool, types::Json};

use super::{DocumentStore, FindOptions, PartialSelect, doc_not_found, ensure_object};
use crate::{
    Error, Result,
    filter::{Filter, pg::PgFilterCompiler},
    metrics,
    schema::{self, COLLECTIONS_TABLE, qualified_name, quote_literal},
};

// jsonb_build_object takes at most 100 arguments.
const PAIRS_PER_OBJECT: usize = 50;

pub(crate) async fn resolve_collection(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
) -> Result<String> {
    let table = sqlx::query_scalar::<_, String>(&format!(
        "select table_name from {} where name = $1",
        qualified_name(schema_name, COLLECTIONS_TABLE)
    ))
    .bind(collection)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
    Ok(qualified_name(schema_name, &table))
}

fn order_clause(options: &FindOptions) -> String {
    let mut terms: Vec<String> = options
        .order_by
        .iter()
        .flat_map(|(path, direction)| sort_terms(path, direction.as_str()))
        .collect();
    terms.push("id collate \"C\"".to_string());
    format!(" order by {}", terms.join(", "))
}

// jsonb sorts strings by the database collation: rank them as one value,
// then break ties bytewise.
fn sort_terms(path: &str, direction: &str) -> [String; 2] {
    let path = json_path(path);
    [
        format!(
            "case when jsonb_typeof({path}) = 'string' then '\"\"'::jsonb else {path} end {direction}"
        ),
        format!(
            "case when jsonb_typeof({path}) = 'string' then ({path} #>> '{{}}') collate \"C\" end {direction}"
        ),
    ]
}

fn page_clause(options: &FindOptions) -> String {
    let mut clause = String::new();
    if let Some(limit) = options.limit {
        clause.push_str(&format!(" limit {limit}"));
    }
    if let Some(skip) = options.skip {
        clause.push_str(&format!(" offset {skip}"));
    }
    clause
}

fn json_path(path: &str) -> String {
    let mut expr = "doc".to_string();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        expr.push_str("->");
        expr.push_str(&quote_literal(segment));
    }
    expr
}

fn projection(select: &PartialSelect) -> String {
    let pairs: Vec<String> = select
        .iter()
        .map(|(alias, path)| format!("{}, {}", quote_literal(alias), json_path(path)))
        .collect();
    if pairs.is_empty() {
        return "'{}'::jsonb".to_string();
    }
    pairs
        .chunks(PAIRS_PER_OBJECT)
        .map(|chunk| format!("jsonb_build_object({})", chunk.join(", ")))
        .collect::<Vec<_>>()
        .join(" || ")
}

pub(crate) async fn add_doc_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    id: &str,
    doc: &Value,
) -> Result<()> {
    ensure_object(collection, id, doc)?;
    let table = resolve_collection(conn, schema_name, collection).await?;
    let inserted = sqlx::query(&format!(
        "insert into {table} (id, doc) values ($1, $2) on conflict (id) do nothing"
    ))
    .bind(id)
    .bind(Json(doc))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Err(Error::DocumentExists {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }
    metrics::record_doc_write(1);
    Ok(())
}

pub(crate) async fn update_doc_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    id: &str,
    patch: &Value,
) -> Result<()> {
    ensure_object(collection, id, patch)?;
    let table = resolve_collection(conn, schema_name, collection).await?;
    let updated = sqlx::query(&format!(
        "update {table} set doc = doc || $2 where id = $1"
    ))
    .bind(id)
    .bind(Json(patch))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(doc_not_found(collection, id));
    }
    metrics::record_doc_write(1);
    Ok(())
}

pub(crate) async fn upsert_doc_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    id: &str,
    doc: &Value,
) -> Result<()> {
    ensure_object(collection, id, doc)?;
    let table = resolve_collection(conn, schema_name, collection).await?;
    sqlx::query(&format!(
        "insert into {table} as t (id, doc) values ($1, $2) on conflict (id) do update set doc = t.doc || excluded.doc"
    ))
    .bind(id)
    .bind(Json(doc))
    .execute(&mut *conn)
    .await?;
    metrics::record_doc_write(1);
    Ok(())
}

pub(crate) async fn replace_doc_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    id: &str,
    doc: &Value,
) -> Result<()> {
    ensure_object(collection, id, doc)?;
    let table = resolve_collection(conn, schema_name, collection).await?;
    let replaced = sqlx::query(&format!("update {table} set doc = $2 where id = $1"))
        .bind(id)
        .bind(Json(doc))
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if replaced == 0 {
        return Err(doc_not_found(collection, id));
    }
    metrics::record_doc_write(1);
    Ok(())
}

pub(crate) async fn delete_doc_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    id: &str,
) -> Result<()> {
    let table = resolve_collection(conn, schema_name, collection).await?;
    let deleted = sqlx::query(&format!("delete from {table} where id = $1"))
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    metrics::record_doc_write(deleted);
    Ok(())
}

/// Applies `set doc = <assignment>` to every document `filter` selects.
/// The assignment refers to the payload as `$n` where n follows the filter's arguments.
async fn rewrite_matching(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    filter: &Filter,
    payload: &Value,
    assignment: impl FnOnce(usize) -> String,
) -> Result<u64> {
    ensure_object(collection, "*", payload)?;
    let table = resolve_collection(conn, schema_name, collection).await?;
    let compiled = PgFilterCompiler::new().compile(filter);
    let placeholder = compiled.next_placeholder(0);
    let mut args = compiled.arguments()?;
    args.add(Json(payload.clone()))
        .map_err(sqlx::Error::Encode)?;
    let sql = format!(
        "update {table} set doc = {} where {}",
        assignment(placeholder),
        compiled.sql
    );
    let changed = sqlx::query_with(&sql, args)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    metrics::record_doc_write(changed);
    Ok(changed)
}

pub(crate) async fn update_many_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    filter: &Filter,
    patch: &Value,
) -> Result<u64> {
    rewrite_matching(conn, schema_name, collection, filter, patch, |n| {
        format!("doc || ${n}::jsonb")
    })
    .await
}

pub(crate) async fn replace_many_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    filter: &Filter,
    doc: &Value,
) -> Result<u64> {
    rewrite_matching(conn, schema_name, collection, filter, doc, |n| {
        format!("${n}::jsonb")
    })
    .await
}

pub(crate) async fn delete_many_in(
    conn: &mut PgConnection,
    schema_name: &str,
    collection: &str,
    filter: &Filter,
) -> Result<u64> {
    let table = resolve_collection(conn, schema_name, collection).await?;
    let compiled = PgFilterCompiler::new().compile(filter);
    let sql = format!("delete from {table} where {}", compiled.sql);
    let deleted = sqlx::query_with(&sql, compiled.arguments()?)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    metrics::record_doc_write(deleted);
    Ok(deleted)
}

#[derive(Clone, Debug)]
pub struct PgDocumentStore {
    pool: PgPool,
    schema: String,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn select_rows(
        &self,
        collection: &str,
        columns: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>> {
        let mut conn = self.pool.acquire().await?;
        let table = resolve_collection(&mut conn, &self.schema, collection).await?;
        let compiled = PgFilterCompiler::new().compile(filter);
        let sql = format!(
            "select id, {columns} from {table} where {}{}{}",
            compiled.sql,
            order_clause(options),
            page_clause(options)
        );
        let rows = sqlx::query_as_with::<_, (String, Json<Value>), _>(&sql, compiled.arguments()?)
            .fetch_all(&mut *conn)
            .await?;
        metrics::record_doc_read(rows.len() as u64);
        Ok(rows.into_iter().map(|(id, doc)| (id, doc.0)).collect())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn add_collection(&self, collection: &str) -> Result<()> {
        let table = schema::collection_table(collection);
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_scalar::<_, String>(&format!(
            "insert into {} (name, table_name) values ($1, $2) on conflict (name) do nothing returning name",
            qualified_name(&self.schema, COLLECTIONS_TABLE)
        ))
        .bind(collection)
        .bind(&table)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_some() {
            sqlx::query(&schema::build_collection_table_sql(&self.schema, &table))
                .execute(&mut *tx)
                .await?;
            tracing::debug!(target: "docket::documents", collection, table = %table, "created collection");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn has_collection(&self, collection: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, String>(&format!(
            "select name from {} where name = $1",
            qualified_name(&self.schema, COLLECTIONS_TABLE)
        ))
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let table = sqlx::query_scalar::<_, String>(&format!(
            "delete from {} where name = $1 returning table_name",
            qualified_name(&self.schema, COLLECTIONS_TABLE)
        ))
        .bind(collection)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        sqlx::query(&format!(
            "drop table if exists {}",
            qualified_name(&self.schema, &table)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(target: "docket::documents", collection, "dropped collection");
        Ok(())
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(&format!(
            "select name from {} order by name",
            qualified_name(&self.schema, COLLECTIONS_TABLE)
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn add_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        add_doc_in(&mut conn, &self.schema, collection, id, &doc).await
    }

    async fn update_doc(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_doc_in(&mut conn, &self.schema, collection, id, &patch).await
    }

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_doc_in(&mut conn, &self.schema, collection, id, &doc).await
    }

    async fn replace_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        replace_doc_in(&mut conn, &self.schema, collection, id, &doc).await
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        delete_doc_in(&mut conn, &self.schema, collection, id).await
    }

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        let table = resolve_collection(&mut conn, &self.schema, collection).await?;
        let doc = sqlx::query_scalar::<_, Json<Value>>(&format!(
            "select doc from {table} where id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        metrics::record_doc_read(u64::from(doc.is_some()));
        Ok(doc.map(|d| d.0))
    }

    async fn get_partial_doc(
        &self,
        collection: &str,
        id: &str,
        select: &PartialSelect,
    ) -> Result<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        let table = resolve_collection(&mut conn, &self.schema, collection).await?;
        let doc = sqlx::query_scalar::<_, Json<Value>>(&format!(
            "select {} from {table} where id = $1",
            projection(select)
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        metrics::record_doc_read(u64::from(doc.is_some()));
        Ok(doc.map(|d| d.0))
    }

    async fn find_docs(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>> {
        self.select_rows(collection, "doc", filter, options).await
    }

    async fn find_partial_docs(
        &self,
        collection: &str,
        select: &PartialSelect,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>> {
        self.select_rows(collection, &projection(select), filter, options)
            .await
    }

    async fn find_doc_ids(&self, collection: &str, filter: &Filter) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        let table = resolve_collection(&mut conn, &self.schema, collection).await?;
        let compiled = PgFilterCompiler::new().compile(filter);
        let sql = format!(
            "select id from {table} where {} order by id collate \"C\"",
            compiled.sql
        );
        Ok(
            sqlx::query_scalar_with::<_, String, _>(&sql, compiled.arguments()?)
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    async fn count_docs(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let table = resolve_collection(&mut conn, &self.schema, collection).await?;
        let compiled = PgFilterCompiler::new().compile(filter);
        let sql = format!("select count(*) from {table} where {}", compiled.sql);
        let count = sqlx::query_scalar_with::<_, i64, _>(&sql, compiled.arguments()?)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as u64)
    }

    async fn update_many(&self, collection: &str, filter: &Filter, patch: Value) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        update_many_in(&mut conn, &self.schema, collection, filter, &patch).await
    }

    async fn replace_many(&self, collection: &str, filter: &Filter, doc: Value) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        replace_many_in(&mut conn, &self.schema, collection, filter, &doc).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        delete_many_in(&mut conn, &self.schema, collection, filter).await
    }
}
