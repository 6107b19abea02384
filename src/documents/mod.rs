//! Read-model document collections queried with [`Filter`].

pub mod memory;
pub mod postgres;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::{Error, Result, filter::Filter, filter::json};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// `(path, direction)` pairs; documents are ordered by id when empty.
    #[serde(default)]
    pub order_by: Vec<(String, SortDirection)>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, path: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((path.into(), direction));
        self
    }
}

/// Output alias → dotted source path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialSelect(BTreeMap<String, String>);

impl PartialSelect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, alias: impl Into<String>, path: impl Into<String>) -> Self {
        self.0.insert(alias.into(), path.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Projects `doc`; absent paths come out as `null`.
    pub fn apply(&self, doc: &Value) -> Value {
        let map: JsonMap<String, Value> = self
            .0
            .iter()
            .map(|(alias, path)| {
                let value = json::get_path(doc, path).cloned().unwrap_or(Value::Null);
                (alias.clone(), value)
            })
            .collect();
        Value::Object(map)
    }
}

impl<A, P> FromIterator<(A, P)> for PartialSelect
where
    A: Into<String>,
    P: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (A, P)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(a, p)| (a.into(), p.into()))
                .collect(),
        )
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn add_collection(&self, collection: &str) -> Result<()>;

    async fn has_collection(&self, collection: &str) -> Result<bool>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn collection_names(&self) -> Result<Vec<String>>;

    /// Fails with [`Error::DocumentExists`] when `id` is taken.
    async fn add_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Merges the top-level keys of `patch` into the stored document.
    async fn update_doc(&self, collection: &str, id: &str, patch: Value) -> Result<()>;

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    async fn replace_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Deleting an absent document is not an error.
    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()>;

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    async fn get_partial_doc(
        &self,
        collection: &str,
        id: &str,
        select: &PartialSelect,
    ) -> Result<Option<Value>>;

    async fn find_docs(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>>;

    async fn find_partial_docs(
        &self,
        collection: &str,
        select: &PartialSelect,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<(String, Value)>>;

    async fn find_doc_ids(&self, collection: &str, filter: &Filter) -> Result<Vec<String>>;

    async fn count_docs(&self, collection: &str, filter: &Filter) -> Result<u64>;

    async fn update_many(&self, collection: &str, filter: &Filter, patch: Value) -> Result<u64>;

    async fn replace_many(&self, collection: &str, filter: &Filter, doc: Value) -> Result<u64>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;
}

pub(crate) fn ensure_object(collection: &str, id: &str, doc: &Value) -> Result<()> {
    if doc.is_object() {
        Ok(())
    } else {
        Err(Error::InvalidDocument(format!(
            "document `{id}` in `{collection}` must be a JSON object"
        )))
    }
}

/// Shallow merge: top-level keys of `patch` overwrite those of `target`.
pub(crate) fn merge_shallow(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

pub(crate) fn doc_not_found(collection: &str, id: &str) -> Error {
    Error::NotFound(format!("document `{id}` in `{collection}`"))
}

/// Orders by the given paths using `jsonb` ordering, ties broken by id.
pub(crate) fn sort_docs(docs: &mut [(String, Value)], order_by: &[(String, SortDirection)]) {
    docs.sort_by(|(left_id, left), (right_id, right)| {
        for (path, direction) in order_by {
            let ordering = compare_opt(json::get_path(left, path), json::get_path(right, path));
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        left_id.cmp(right_id)
    });
}

// SQL NULL (missing path) sorts after every value ascending.
fn compare_opt(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(l), Some(r)) => json::compare(l, r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) fn paginate<T>(items: Vec<T>, options: &FindOptions) -> Vec<T> {
    items
        .into_iter()
        .skip(options.skip.unwrap_or(0))
        .take(options.limit.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_select_projects_aliases() {
        let select: PartialSelect = [("who", "customer.name"), ("missing", "nope")]
            .into_iter()
            .collect();
        let doc = json!({"customer": {"name": "Ada"}});
        assert_eq!(select.apply(&doc), json!({"who": "Ada", "missing": null}));
    }

    #[test]
    fn merge_overwrites_top_level_only() {
        let mut doc = json!({"a": {"x": 1}, "b": 2});
        merge_shallow(&mut doc, &json!({"a": {"y": 2}, "c": 3}));
        assert_eq!(doc, json!({"a": {"y": 2}, "b": 2, "c": 3}));
    }

    #[test]
    fn sort_uses_paths_then_id() {
        let mut docs = vec![
            ("3".to_string(), json!({"n": 1})),
            ("1".to_string(), json!({"n": 2})),
            ("2".to_string(), json!({"n": 1})),
            ("0".to_string(), json!({})),
        ];
        sort_docs(&mut docs, &[("n".to_string(), SortDirection::Desc)]);
        let ids: Vec<&str> = docs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
        sort_docs(&mut docs, &[("n".to_string(), SortDirection::Asc)]);
        let ids: Vec<&str> = docs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1", "0"]);
    }

    #[test]
    fn paginate_skips_then_limits() {
        let page = paginate((0..10).collect(), &FindOptions::new().skip(3).limit(2));
        assert_eq!(page, vec![3, 4]);
    }
}
