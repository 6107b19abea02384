use std::collections::HashSet;

use crate::{Result, events::StreamKind};
use indoc::formatdoc;
use sqlx::{PgExecutor, PgPool};

pub const STREAMS_TABLE: &str = "docket_streams";
pub const COLLECTIONS_TABLE: &str = "docket_collections";

const MAX_TABLE_STEM: usize = 24;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
    schema: String,
}

impl SchemaManager {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn plan(&self) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = self.schema.trim();
        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            STREAMS_TABLE,
            build_streams_registry_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            COLLECTIONS_TABLE,
            build_collections_registry_sql,
        );
        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!(target: "docket::schema", schema = %self.schema, actions = plan.actions.len(), "applied schema plan");
        Ok(())
    }

    pub async fn sync(&self) -> Result<SchemaPlan> {
        let plan = self.plan().await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        existing_tables(&self.pool, schema).await
    }
}

pub(crate) async fn existing_tables<'e, E>(executor: E, schema: &str) -> Result<HashSet<String>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_scalar::<_, String>(
        "select table_name from information_schema.tables where table_schema = $1",
    )
    .bind(schema)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().collect())
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn build_streams_registry_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            name text primary key,
            table_name text not null unique,
            kind text not null,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, STREAMS_TABLE),
    )
}

fn build_collections_registry_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            name text primary key,
            table_name text not null unique,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, COLLECTIONS_TABLE),
    )
}

/// Statements creating one stream table, in execution order.
pub fn build_stream_table_sql(schema: &str, table: &str, kind: StreamKind) -> Vec<String> {
    let qualified = qualified_name(schema, table);
    let aggregate_checks = match kind {
        StreamKind::WriteModel => formatdoc!(
            ",
                check ((meta->>'aggregateType') is not null),
                check ((meta->>'aggregateId') is not null),
                check ((meta->'aggregateVersion') is not null and meta->'aggregateVersion' <> 'null'::jsonb)"
        ),
        StreamKind::Unconstrained => String::new(),
    };
    let mut statements = vec![formatdoc!(
        "
        create table if not exists {qualified} (
            no bigserial primary key,
            uuid uuid not null unique,
            name text not null,
            payload json not null,
            meta jsonb not null default '{{}}'::jsonb,
            created_at timestamptz not null default now(){aggregate_checks}
        )
        ",
        qualified = qualified,
        aggregate_checks = aggregate_checks,
    )];
    if kind == StreamKind::WriteModel {
        statements.push(formatdoc!(
            "
            create unique index if not exists {index} on {qualified}
                ((meta->>'aggregateType'), (meta->>'aggregateId'), (meta->'aggregateVersion'))
            ",
            index = quote_ident(&format!("{table}_aggregate_version_key")),
            qualified = qualified,
        ));
        statements.push(formatdoc!(
            "
            create index if not exists {index} on {qualified}
                ((meta->>'aggregateType'), (meta->>'aggregateId'), no)
            ",
            index = quote_ident(&format!("{table}_aggregate_idx")),
            qualified = qualified,
        ));
    }
    statements
}

pub fn build_collection_table_sql(schema: &str, table: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id text primary key,
            doc jsonb not null
        )
        ",
        table = qualified_name(schema, table),
    )
}

pub fn stream_table(stream: &str) -> String {
    table_name("stream_", stream)
}

pub fn collection_table(collection: &str) -> String {
    table_name("doc_", collection)
}

/// Lowercased, identifier-safe table name. Names that had to be altered get
/// a hash suffix so distinct streams never share a table.
fn table_name(prefix: &str, name: &str) -> String {
    let mut normalized: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_TABLE_STEM)
        .collect();
    if normalized != name || normalized.is_empty() {
        normalized.push_str(&format!("_{:08x}", fnv1a(name) as u32));
    }
    format!("{prefix}{normalized}")
}

fn fnv1a(value: &str) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in value.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}
