//! Composable document predicates.
//!
//! A [`Filter`] is plain data: it is built once per query, evaluated in
//! process by [`Filter::matches`] and compiled for Postgres by
//! [`pg::PgFilterCompiler`]. Both paths must select the same documents.

pub(crate) mod json;
pub mod pg;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Filter {
    /// Matches every document.
    Any,
    Eq {
        prop: String,
        value: Value,
    },
    Gt {
        prop: String,
        value: Value,
    },
    Gte {
        prop: String,
        value: Value,
    },
    Lt {
        prop: String,
        value: Value,
    },
    Lte {
        prop: String,
        value: Value,
    },
    /// Case-insensitive SQL `LIKE` over the text form of the property.
    Like {
        prop: String,
        value: String,
    },
    Exists {
        prop: String,
    },
    /// The property is an array holding `value`.
    InArray {
        prop: String,
        value: Value,
    },
    /// The property equals one of `values`.
    AnyOf {
        prop: String,
        values: Vec<Value>,
    },
    DocId {
        id: String,
    },
    AnyOfDocId {
        ids: Vec<String>,
    },
    And {
        filters: Vec<Filter>,
    },
    Or {
        filters: Vec<Filter>,
    },
    Not {
        filter: Box<Filter>,
    },
}

impl Filter {
    pub fn any() -> Self {
        Filter::Any
    }

    pub fn eq(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn gt(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn gte(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn lt(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn lte(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn like(prop: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Like {
            prop: prop.into(),
            value: pattern.into(),
        }
    }

    pub fn exists(prop: impl Into<String>) -> Self {
        Filter::Exists { prop: prop.into() }
    }

    pub fn in_array(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::InArray {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn any_of<I, V>(prop: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::AnyOf {
            prop: prop.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn doc_id(id: impl Into<String>) -> Self {
        Filter::DocId { id: id.into() }
    }

    pub fn any_of_doc_id<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::AnyOfDocId {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Evaluates the filter against an in-process document.
    pub fn matches(&self, id: &str, doc: &Value) -> bool {
        match self {
            Filter::Any => true,
            Filter::Eq { prop, value } => {
                json::get_path(doc, prop).is_some_and(|v| json::json_eq(v, value))
            }
            Filter::Gt { prop, value } => compare_at(doc, prop, value, |o| o == Ordering::Greater),
            Filter::Gte { prop, value } => compare_at(doc, prop, value, |o| o != Ordering::Less),
            Filter::Lt { prop, value } => compare_at(doc, prop, value, |o| o == Ordering::Less),
            Filter::Lte { prop, value } => {
                compare_at(doc, prop, value, |o| o != Ordering::Greater)
            }
            Filter::Like { prop, value } => json::get_path(doc, prop)
                .and_then(json::text_of)
                .is_some_and(|text| like_matches(&text, value)),
            Filter::Exists { prop } => {
                let (parent, leaf) = json::split_leaf(prop);
                let parent = match parent {
                    Some(path) => json::get_path(doc, path),
                    None => Some(doc),
                };
                parent.is_some_and(|p| json::has_key(p, leaf))
            }
            Filter::InArray { prop, value } => match json::get_path(doc, prop) {
                Some(Value::Array(items)) => items.iter().any(|item| json::contains(item, value)),
                _ => false,
            },
            Filter::AnyOf { prop, values } => json::get_path(doc, prop)
                .is_some_and(|v| values.iter().any(|candidate| json::json_eq(v, candidate))),
            Filter::DocId { id: wanted } => id == wanted,
            Filter::AnyOfDocId { ids } => ids.iter().any(|wanted| wanted == id),
            Filter::And { filters } => filters.iter().all(|f| f.matches(id, doc)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(id, doc)),
            Filter::Not { filter } => !filter.matches(id, doc),
        }
    }
}

fn compare_at(doc: &Value, prop: &str, value: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    json::get_path(doc, prop).is_some_and(|v| accept(json::compare(v, value)))
}

/// `ILIKE` semantics: `%` matches any run, `_` one character, `\` escapes.
pub(crate) fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<Token> = tokenize_like(&pattern.to_lowercase());

    // dp[j]: pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for token in &pattern {
        let mut next = vec![false; text.len() + 1];
        match token {
            Token::AnyRun => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= dp[j];
                    next[j] = reachable;
                }
            }
            Token::AnyOne => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            Token::Literal(c) => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

enum Token {
    AnyRun,
    AnyOne,
    Literal(char),
}

fn tokenize_like(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => tokens.push(Token::AnyRun),
            '_' => tokens.push(Token::AnyOne),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    tokens.push(Token::Literal(escaped));
                }
            }
            c => tokens.push(Token::Literal(c)),
        }
    }
    tokens
}
