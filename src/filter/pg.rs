//! Compiles [`Filter`] trees into Postgres predicates over a `jsonb` column.

use serde_json::Value;
use sqlx::{Arguments, postgres::PgArguments, types::Json};

use super::{Filter, json::split_leaf};
use crate::{Result, schema::quote_literal};

/// A bound argument registered while compiling.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterArg {
    /// Bound as `jsonb`.
    Json(Value),
    Text(String),
    TextList(Vec<String>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub args: Vec<FilterArg>,
}

impl CompiledFilter {
    /// Collects the arguments ready for `sqlx::query_with`.
    pub fn arguments(&self) -> Result<PgArguments> {
        let mut arguments = PgArguments::default();
        for arg in &self.args {
            match arg {
                FilterArg::Json(value) => arguments.add(Json(value.clone())),
                FilterArg::Text(text) => arguments.add(text.clone()),
                FilterArg::TextList(list) => arguments.add(list.clone()),
            }
            .map_err(sqlx::Error::Encode)?;
        }
        Ok(arguments)
    }

    /// Number of the first placeholder free after this fragment.
    pub fn next_placeholder(&self, offset: usize) -> usize {
        offset + self.args.len() + 1
    }
}

#[derive(Debug)]
pub struct PgFilterCompiler {
    doc_column: String,
    id_column: String,
    offset: usize,
    args: Vec<FilterArg>,
}

impl Default for PgFilterCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl PgFilterCompiler {
    pub fn new() -> Self {
        Self {
            doc_column: "doc".to_string(),
            id_column: "id".to_string(),
            offset: 0,
            args: Vec::new(),
        }
    }

    /// Numbers the first argument `$offset + 1`.
    pub fn starting_at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn columns(mut self, doc_column: impl Into<String>, id_column: impl Into<String>) -> Self {
        self.doc_column = doc_column.into();
        self.id_column = id_column.into();
        self
    }

    pub fn compile(mut self, filter: &Filter) -> CompiledFilter {
        let sql = self.process(filter);
        CompiledFilter {
            sql,
            args: self.args,
        }
    }

    fn bind(&mut self, arg: FilterArg) -> String {
        self.args.push(arg);
        format!("${}", self.offset + self.args.len())
    }

    fn value_path(&self, prop: &str) -> String {
        let mut expr = self.doc_column.clone();
        for segment in prop.split('.').filter(|s| !s.is_empty()) {
            expr.push_str("->");
            expr.push_str(&quote_literal(segment));
        }
        expr
    }

    fn text_path(&self, prop: &str) -> String {
        match split_leaf(prop) {
            (Some(parent), leaf) => {
                format!("{}->>{}", self.value_path(parent), quote_literal(leaf))
            }
            (None, leaf) => format!("{}->>{}", self.doc_column, quote_literal(leaf)),
        }
    }

    // `->` yields NULL for a missing path; SQL NULL must read as false under NOT.
    fn guard(leaf: String) -> String {
        format!("coalesce({leaf}, false)")
    }

    fn compare(&mut self, prop: &str, op: &str, value: &Value) -> String {
        let path = self.value_path(prop);
        match value {
            // jsonb orders strings by the database collation; compare them bytewise.
            Value::String(text) if op != "=" => {
                let text_arg = self.bind(FilterArg::Text(text.clone()));
                let json_arg = self.bind(FilterArg::Json(value.clone()));
                Self::guard(format!(
                    "case when jsonb_typeof({path}) = 'string' then ({path} #>> '{{}}') collate \"C\" {op} {text_arg} else {path} {op} {json_arg}::jsonb end"
                ))
            }
            _ => {
                let placeholder = self.bind(FilterArg::Json(value.clone()));
                Self::guard(format!("{path} {op} {placeholder}::jsonb"))
            }
        }
    }

    fn join(&mut self, filters: &[Filter], op: &str, empty: &str) -> String {
        if filters.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = filters
            .iter()
            .map(|f| format!("({})", self.process(f)))
            .collect();
        parts.join(op)
    }

    fn process(&mut self, filter: &Filter) -> String {
        match filter {
            Filter::Any => "true".to_string(),
            Filter::Eq { prop, value } => self.compare(prop, "=", value),
            Filter::Gt { prop, value } => self.compare(prop, ">", value),
            Filter::Gte { prop, value } => self.compare(prop, ">=", value),
            Filter::Lt { prop, value } => self.compare(prop, "<", value),
            Filter::Lte { prop, value } => self.compare(prop, "<=", value),
            Filter::Like { prop, value } => {
                let path = self.text_path(prop);
                let placeholder = self.bind(FilterArg::Text(value.clone()));
                Self::guard(format!("{path} ILIKE {placeholder}"))
            }
            Filter::Exists { prop } => {
                let (parent, leaf) = split_leaf(prop);
                let parent = match parent {
                    Some(path) => self.value_path(path),
                    None => self.doc_column.clone(),
                };
                Self::guard(format!("{parent} ? {}", quote_literal(leaf)))
            }
            Filter::InArray { prop, value } => {
                let path = self.value_path(prop);
                let placeholder = self.bind(FilterArg::Json(value.clone()));
                Self::guard(format!("{path} @> jsonb_build_array({placeholder}::jsonb)"))
            }
            Filter::AnyOf { prop, values } => {
                let path = self.value_path(prop);
                let placeholder = self.bind(FilterArg::Json(Value::Array(values.clone())));
                Self::guard(format!(
                    "{path} IN (SELECT jsonb_array_elements({placeholder}::jsonb))"
                ))
            }
            Filter::DocId { id } => {
                let placeholder = self.bind(FilterArg::Text(id.clone()));
                format!("({} = {placeholder})", self.id_column)
            }
            Filter::AnyOfDocId { ids } => {
                let placeholder = self.bind(FilterArg::TextList(ids.clone()));
                format!("({} = ANY({placeholder}))", self.id_column)
            }
            Filter::And { filters } => self.join(filters, " AND ", "true"),
            Filter::Or { filters } => self.join(filters, " OR ", "false"),
            Filter::Not { filter } => format!("NOT ({})", self.process(filter)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_dereferences_property_and_binds_json() {
        let compiled = PgFilterCompiler::new().compile(&Filter::eq("status", "open"));
        assert_eq!(compiled.sql, "coalesce(doc->'status' = $1::jsonb, false)");
        assert_eq!(compiled.args, vec![FilterArg::Json(json!("open"))]);
    }

    #[test]
    fn and_parenthesizes_children_and_shares_numbering() {
        let compiled = PgFilterCompiler::new().compile(&Filter::and(vec![
            Filter::eq("status", "open"),
            Filter::gt("customer.age", 18),
        ]));
        assert_eq!(
            compiled.sql,
            "(coalesce(doc->'status' = $1::jsonb, false)) AND (coalesce(doc->'customer'->'age' > $2::jsonb, false))"
        );
        assert_eq!(
            compiled.args,
            vec![FilterArg::Json(json!("open")), FilterArg::Json(json!(18))]
        );
    }

    #[test]
    fn like_uses_text_dereference_and_raw_argument() {
        let compiled = PgFilterCompiler::new().compile(&Filter::like("customer.name", "ada%"));
        assert_eq!(
            compiled.sql,
            "coalesce(doc->'customer'->>'name' ILIKE $1, false)"
        );
        assert_eq!(compiled.args, vec![FilterArg::Text("ada%".into())]);
    }

    #[test]
    fn exists_targets_parent_with_leaf_key() {
        let nested = PgFilterCompiler::new().compile(&Filter::exists("a.b.c"));
        assert_eq!(nested.sql, "coalesce(doc->'a'->'b' ? 'c', false)");
        assert!(nested.args.is_empty());
        let top = PgFilterCompiler::new().compile(&Filter::exists("a"));
        assert_eq!(top.sql, "coalesce(doc ? 'a', false)");
    }

    #[test]
    fn negated_leaves_treat_missing_paths_as_false() {
        let compiled = PgFilterCompiler::new().compile(&Filter::negate(Filter::or(vec![
            Filter::eq("missing", 1),
            Filter::like("missing", "x%"),
            Filter::exists("absent.leaf"),
        ])));
        assert_eq!(
            compiled.sql,
            "NOT ((coalesce(doc->'missing' = $1::jsonb, false)) OR (coalesce(doc->>'missing' ILIKE $2, false)) OR (coalesce(doc->'absent' ? 'leaf', false)))"
        );
    }

    #[test]
    fn string_ranges_compare_bytewise() {
        let compiled = PgFilterCompiler::new().compile(&Filter::gt("name", "B"));
        assert_eq!(
            compiled.sql,
            "coalesce(case when jsonb_typeof(doc->'name') = 'string' then (doc->'name' #>> '{}') collate \"C\" > $1 else doc->'name' > $2::jsonb end, false)"
        );
        assert_eq!(
            compiled.args,
            vec![FilterArg::Text("B".into()), FilterArg::Json(json!("B"))]
        );

        // equality is collation independent
        let eq = PgFilterCompiler::new().compile(&Filter::eq("name", "B"));
        assert_eq!(eq.args.len(), 1);
    }

    #[test]
    fn doc_ids_bypass_the_document() {
        let compiled = PgFilterCompiler::new().compile(&Filter::or(vec![
            Filter::doc_id("1"),
            Filter::any_of_doc_id(["2", "3"]),
        ]));
        assert_eq!(compiled.sql, "((id = $1)) OR ((id = ANY($2)))");
        assert_eq!(
            compiled.args,
            vec![
                FilterArg::Text("1".into()),
                FilterArg::TextList(vec!["2".into(), "3".into()])
            ]
        );
    }

    #[test]
    fn not_any_and_offsets() {
        let compiled = PgFilterCompiler::new()
            .starting_at(2)
            .compile(&Filter::negate(Filter::and(vec![
                Filter::Any,
                Filter::any_of("status", ["a", "b"]),
                Filter::in_array("tags", "x"),
            ])));
        assert_eq!(
            compiled.sql,
            "NOT ((true) AND (coalesce(doc->'status' IN (SELECT jsonb_array_elements($3::jsonb)), false)) AND (coalesce(doc->'tags' @> jsonb_build_array($4::jsonb), false)))"
        );
        assert_eq!(compiled.next_placeholder(2), 5);
    }

    #[test]
    fn path_segments_are_quoted() {
        let compiled = PgFilterCompiler::new().compile(&Filter::eq("o'brien", 1));
        assert_eq!(compiled.sql, "coalesce(doc->'o''brien' = $1::jsonb, false)");
    }
}
