//! Declarative rules: parsed once into [`Rule`] and [`Then`], run by [`Interpreter`].
//!
//! ```json
//! [
//!   {"rule": "condition", "if": "x > 0", "then": {"assign": {"variable": "y", "value": "'pos'"}}, "stop": true},
//!   {"rule": "always", "then": [{"log": {"msg": "'fallthrough'"}}]}
//! ]
//! ```

pub mod expr;
mod interpreter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::{
    Error, Result,
    documents::{PartialSelect, SortDirection},
    events::Event,
    filter::Filter,
};

pub use interpreter::{Interpreter, InterpreterBuilder};

/// Mapping key whose evaluated objects are spread into the parent object.
pub const MERGE_KEY: &str = "$merge";

/// Resolves expression strings against an execution context.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, context: &Value) -> Result<Value>;

    fn test(&self, expr: &str, context: &Value) -> Result<bool> {
        Ok(expr::truthy(&self.evaluate(expr, context)?))
    }
}

/// External services reachable from `call` actions.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    fn call(&self, service: &str, method: &str, arguments: Vec<Value>) -> Result<Value>;

    async fn call_async(&self, service: &str, method: &str, arguments: Vec<Value>) -> Result<Value> {
        self.call(service, method, arguments)
    }
}

/// Command bus used by `trigger` actions.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, command: &str, payload: Value, meta: Value) -> Result<Value>;
}

pub trait EventFactory: Send + Sync {
    fn build(&self, payload: Value, meta: JsonMap<String, Value>) -> Result<Event>;
}

impl<F> EventFactory for F
where
    F: Fn(Value, JsonMap<String, Value>) -> Result<Event> + Send + Sync,
{
    fn build(&self, payload: Value, meta: JsonMap<String, Value>) -> Result<Event> {
        self(payload, meta)
    }
}

struct NamedEvent(String);

impl EventFactory for NamedEvent {
    fn build(&self, payload: Value, meta: JsonMap<String, Value>) -> Result<Event> {
        let mut event = Event::new(self.0.clone(), payload);
        event.meta.extend(meta);
        Ok(event)
    }
}

/// Event factories and information names known to the interpreter.
#[derive(Clone, Default)]
pub struct Registry {
    events: HashMap<String, Arc<dyn EventFactory>>,
    informations: HashMap<String, String>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut events: Vec<&String> = self.events.keys().collect();
        events.sort();
        f.debug_struct("Registry")
            .field("events", &events)
            .field("informations", &self.informations)
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event whose payload and meta are taken as mapped.
    pub fn event(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let factory = Arc::new(NamedEvent(name.clone()));
        self.event_factory(name, factory)
    }

    pub fn event_factory(mut self, name: impl Into<String>, factory: Arc<dyn EventFactory>) -> Self {
        self.events.insert(name.into(), factory);
        self
    }

    /// Registers an information backed by the collection of the same name.
    pub fn information(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let collection = name.clone();
        self.information_as(name, collection)
    }

    pub fn information_as(mut self, name: impl Into<String>, collection: impl Into<String>) -> Self {
        self.informations.insert(name.into(), collection.into());
        self
    }

    pub fn build_event(
        &self,
        name: &str,
        payload: Value,
        meta: JsonMap<String, Value>,
    ) -> Result<Event> {
        self.events
            .get(name)
            .ok_or_else(|| Error::UnknownEventFactory(name.to_string()))?
            .build(payload, meta)
    }

    pub fn collection(&self, information: &str) -> Result<&str> {
        self.informations
            .get(information)
            .map(String::as_str)
            .ok_or_else(|| Error::CollectionNotFound(information.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub enum Rule {
    Always {
        then: Vec<Then>,
    },
    If {
        condition: String,
        then: Vec<Then>,
        otherwise: Option<Vec<Then>>,
        stop: bool,
    },
    IfNot {
        condition: String,
        then: Vec<Then>,
        otherwise: Option<Vec<Then>>,
        stop: bool,
    },
}

impl Rule {
    pub fn always(then: Vec<Then>) -> Self {
        Rule::Always { then }
    }

    pub fn when(condition: impl Into<String>, then: Vec<Then>) -> Self {
        Rule::If {
            condition: condition.into(),
            then,
            otherwise: None,
            stop: false,
        }
    }

    pub fn unless(condition: impl Into<String>, then: Vec<Then>) -> Self {
        Rule::IfNot {
            condition: condition.into(),
            then,
            otherwise: None,
            stop: false,
        }
    }

    /// Sets the else branch. No effect on `always` rules.
    pub fn otherwise(mut self, actions: Vec<Then>) -> Self {
        if let Rule::If { otherwise, .. } | Rule::IfNot { otherwise, .. } = &mut self {
            *otherwise = Some(actions);
        }
        self
    }

    /// Stops the chain after this rule's `then` runs. No effect on `always` rules.
    pub fn stop(mut self) -> Self {
        if let Rule::If { stop, .. } | Rule::IfNot { stop, .. } = &mut self {
            *stop = true;
        }
        self
    }
}

/// Parses a JSON rule list.
pub fn parse_rules(value: Value) -> Result<Vec<Rule>> {
    serde_json::from_value(value).map_err(|err| Error::InvalidRule(err.to_string()))
}

pub fn parse_rules_str(text: &str) -> Result<Vec<Rule>> {
    serde_json::from_str(text).map_err(|err| Error::InvalidRule(err.to_string()))
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    rule: String,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    if_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    if_not: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    then: Vec<Then>,
    #[serde(
        rename = "else",
        default,
        deserialize_with = "optional_actions",
        skip_serializing_if = "Option::is_none"
    )]
    else_: Option<Vec<Then>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop: Option<bool>,
}

impl TryFrom<RawRule> for Rule {
    type Error = Error;

    fn try_from(raw: RawRule) -> Result<Self> {
        check_actions(&raw.then)?;
        if let Some(otherwise) = &raw.else_ {
            check_actions(otherwise)?;
        }
        match raw.rule.as_str() {
            "always" => {
                if raw.if_.is_some() || raw.if_not.is_some() || raw.else_.is_some() || raw.stop.is_some() {
                    return Err(Error::InvalidRule(
                        "an `always` rule takes only `then`".to_string(),
                    ));
                }
                Ok(Rule::Always { then: raw.then })
            }
            "condition" => {
                let stop = raw.stop.unwrap_or(false);
                match (raw.if_, raw.if_not) {
                    (Some(condition), None) => Ok(Rule::If {
                        condition,
                        then: raw.then,
                        otherwise: raw.else_,
                        stop,
                    }),
                    (None, Some(condition)) => Ok(Rule::IfNot {
                        condition,
                        then: raw.then,
                        otherwise: raw.else_,
                        stop,
                    }),
                    _ => Err(Error::InvalidRule(
                        "a `condition` rule needs exactly one of `if` and `if_not`".to_string(),
                    )),
                }
            }
            other => Err(Error::InvalidRule(format!("unknown rule kind `{other}`"))),
        }
    }
}

impl From<Rule> for RawRule {
    fn from(rule: Rule) -> Self {
        match rule {
            Rule::Always { then } => RawRule {
                rule: "always".to_string(),
                if_: None,
                if_not: None,
                then,
                else_: None,
                stop: None,
            },
            Rule::If {
                condition,
                then,
                otherwise,
                stop,
            } => RawRule {
                rule: "condition".to_string(),
                if_: Some(condition),
                if_not: None,
                then,
                else_: otherwise,
                stop: stop.then_some(true),
            },
            Rule::IfNot {
                condition,
                then,
                otherwise,
                stop,
            } => RawRule {
                rule: "condition".to_string(),
                if_: None,
                if_not: Some(condition),
                then,
                else_: otherwise,
                stop: stop.then_some(true),
            },
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<Then>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Actions {
        Many(Vec<Then>),
        One(Then),
    }

    Ok(match Actions::deserialize(deserializer)? {
        Actions::Many(actions) => actions,
        Actions::One(action) => vec![action],
    })
}

fn optional_actions<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<Then>>, D::Error>
where
    D: Deserializer<'de>,
{
    one_or_many(deserializer).map(Some)
}

fn check_actions(actions: &[Then]) -> Result<()> {
    actions.iter().try_for_each(Then::check)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Then {
    Assign(Assign),
    Record(Record),
    Trigger(Trigger),
    Call(Call),
    Find(Query),
    FindOne(Query),
    FindPartial(Query),
    FindOnePartial(Query),
    FindById(Query),
    FindPartialById(Query),
    Count(Query),
    Insert(DocWrite),
    Upsert(DocWrite),
    Update(DocChange),
    Replace(DocChange),
    Delete(DocDelete),
    LookupUser(LookupUser),
    LookupUsers(LookupUsers),
    ForEach(ForEach),
    Filter(RuleFilter),
    Execute(Execute),
    Log(Log),
}

impl Then {
    pub fn kind(&self) -> &'static str {
        match self {
            Then::Assign(_) => "assign",
            Then::Record(_) => "record",
            Then::Trigger(_) => "trigger",
            Then::Call(_) => "call",
            Then::Find(_) => "find",
            Then::FindOne(_) => "findOne",
            Then::FindPartial(_) => "findPartial",
            Then::FindOnePartial(_) => "findOnePartial",
            Then::FindById(_) => "findById",
            Then::FindPartialById(_) => "findPartialById",
            Then::Count(_) => "count",
            Then::Insert(_) => "insert",
            Then::Upsert(_) => "upsert",
            Then::Update(_) => "update",
            Then::Replace(_) => "replace",
            Then::Delete(_) => "delete",
            Then::LookupUser(_) => "lookupUser",
            Then::LookupUsers(_) => "lookupUsers",
            Then::ForEach(_) => "forEach",
            Then::Filter(_) => "filter",
            Then::Execute(_) => "execute",
            Then::Log(_) => "log",
        }
    }

    fn check(&self) -> Result<()> {
        let missing = |field: &str| -> Result<()> {
            Err(Error::InvalidRule(format!(
                "`{}` requires `{field}`",
                self.kind()
            )))
        };
        match self {
            Then::FindById(query) if query.id.is_none() => missing("id"),
            Then::FindPartialById(query) if query.id.is_none() => missing("id"),
            Then::FindPartial(query) | Then::FindOnePartial(query) | Then::FindPartialById(query)
                if query.select.as_ref().is_none_or(PartialSelect::is_empty) =>
            {
                missing("select")
            }
            Then::ForEach(each) => check_actions(&each.then),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    pub variable: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub event: String,
    pub mapping: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub command: String,
    pub mapping: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Receives the dispatcher's reply when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CallResult>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

/// Where a call's reply goes. `mapping` sees the raw reply as `result`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub information: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RuleFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<PartialSelect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<(String, SortDirection)>,
    pub variable: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocWrite {
    pub information: String,
    pub id: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocChange {
    pub information: String,
    pub filter: RuleFilter,
    pub set: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocDelete {
    pub information: String,
    pub filter: RuleFilter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupUser {
    pub user: String,
    pub variable: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupUsers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RuleFilter>,
    pub variable: String,
}

/// Runs `then` once per element of `variable`, binding `item` and `itemKey`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForEach {
    pub variable: String,
    #[serde(deserialize_with = "one_or_many")]
    pub then: Vec<Then>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execute {
    pub rules: Vec<Rule>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub msg: Value,
    #[serde(default)]
    pub level: LogLevel,
}

/// A [`Filter`] whose values are value mappings, resolved per execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleFilter {
    Any,
    Eq(PropValue),
    Gt(PropValue),
    Gte(PropValue),
    Lt(PropValue),
    Lte(PropValue),
    Like(PropValue),
    Exists(String),
    InArray(PropValue),
    /// `value` must evaluate to an array.
    AnyOf(PropValue),
    DocId(String),
    AnyOfDocId(String),
    And(Vec<RuleFilter>),
    Or(Vec<RuleFilter>),
    Not(Box<RuleFilter>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropValue {
    pub prop: String,
    pub value: Value,
}

/// Evaluates a value mapping.
///
/// Strings are expressions, arrays and objects are mapped element-wise and
/// other literals pass through. Objects under [`MERGE_KEY`] are spread into
/// the parent first, so explicit keys win over merged ones.
pub fn map_value(evaluator: &dyn Evaluator, mapping: &Value, context: &Value) -> Result<Value> {
    match mapping {
        Value::String(expr) => evaluator.evaluate(expr, context),
        Value::Array(items) => items
            .iter()
            .map(|item| map_value(evaluator, item, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut mapped = JsonMap::new();
            if let Some(sources) = fields.get(MERGE_KEY) {
                let sources = match sources {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for source in sources {
                    match map_value(evaluator, source, context)? {
                        Value::Object(spread) => mapped.extend(spread),
                        Value::Null => {}
                        other => {
                            return Err(Error::Interpreter(format!(
                                "`{MERGE_KEY}` expects objects, got {other}"
                            )));
                        }
                    }
                }
            }
            for (key, value) in fields {
                if key != MERGE_KEY {
                    mapped.insert(key.clone(), map_value(evaluator, value, context)?);
                }
            }
            Ok(Value::Object(mapped))
        }
        literal => Ok(literal.clone()),
    }
}

/// Resolves a rule filter into a plain [`Filter`] for the current context.
pub fn resolve_filter(
    evaluator: &dyn Evaluator,
    filter: &RuleFilter,
    context: &Value,
) -> Result<Filter> {
    let value = |pv: &PropValue| map_value(evaluator, &pv.value, context);
    Ok(match filter {
        RuleFilter::Any => Filter::Any,
        RuleFilter::Eq(pv) => Filter::eq(pv.prop.clone(), value(pv)?),
        RuleFilter::Gt(pv) => Filter::gt(pv.prop.clone(), value(pv)?),
        RuleFilter::Gte(pv) => Filter::gte(pv.prop.clone(), value(pv)?),
        RuleFilter::Lt(pv) => Filter::lt(pv.prop.clone(), value(pv)?),
        RuleFilter::Lte(pv) => Filter::lte(pv.prop.clone(), value(pv)?),
        RuleFilter::Like(pv) => match value(pv)? {
            Value::String(pattern) => Filter::like(pv.prop.clone(), pattern),
            other => {
                return Err(Error::Interpreter(format!(
                    "`like` on `{}` expects a string pattern, got {other}",
                    pv.prop
                )));
            }
        },
        RuleFilter::Exists(prop) => Filter::exists(prop.clone()),
        RuleFilter::InArray(pv) => Filter::in_array(pv.prop.clone(), value(pv)?),
        RuleFilter::AnyOf(pv) => match value(pv)? {
            Value::Array(values) => Filter::any_of(pv.prop.clone(), values),
            other => {
                return Err(Error::Interpreter(format!(
                    "`anyOf` on `{}` expects an array, got {other}",
                    pv.prop
                )));
            }
        },
        RuleFilter::DocId(expr) => Filter::doc_id(doc_id(&evaluator.evaluate(expr, context)?)?),
        RuleFilter::AnyOfDocId(expr) => match evaluator.evaluate(expr, context)? {
            Value::Array(ids) => Filter::any_of_doc_id(ids.iter().map(doc_id).collect::<Result<Vec<_>>>()?),
            other => {
                return Err(Error::Interpreter(format!(
                    "`anyOfDocId` expects an array of ids, got {other}"
                )));
            }
        },
        RuleFilter::And(filters) => Filter::and(
            filters
                .iter()
                .map(|f| resolve_filter(evaluator, f, context))
                .collect::<Result<_>>()?,
        ),
        RuleFilter::Or(filters) => Filter::or(
            filters
                .iter()
                .map(|f| resolve_filter(evaluator, f, context))
                .collect::<Result<_>>()?,
        ),
        RuleFilter::Not(inner) => Filter::negate(resolve_filter(evaluator, inner, context)?),
    })
}

/// Document ids are strings; numeric ids are accepted in their decimal form.
pub(crate) fn doc_id(value: &Value) -> Result<String> {
    match value {
        Value::String(id) => Ok(id.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Interpreter(format!(
            "document id must be a string, got {other}"
        ))),
    }
}

/// Sets a dotted variable path, creating intermediate objects.
pub(crate) fn assign_path(context: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut segments = path.split('.').peekable();
    let mut current = context;
    while let Some(segment) = segments.next() {
        let Value::Object(fields) = current else {
            return Err(Error::Interpreter(format!(
                "cannot assign `{path}`: `{segment}` is not inside an object"
            )));
        };
        if segments.peek().is_none() {
            fields.insert(segment.to_string(), value);
            return Ok(());
        }
        current = fields
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
    }
    Err(Error::Interpreter("empty variable name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::expr::ExprEvaluator;
    use serde_json::json;

    #[test]
    fn parses_always_and_condition_rules() {
        let rules = parse_rules(json!([
            {"rule": "condition", "if": "x > 0", "then": {"assign": {"variable": "y", "value": "'pos'"}}, "stop": true},
            {"rule": "condition", "if_not": "done", "then": [], "else": {"log": {"msg": "'skip'"}}},
            {"rule": "always", "then": [{"assign": {"variable": "y", "value": "'non-positive'"}}]}
        ]))
        .unwrap();
        assert_eq!(
            rules[0],
            Rule::when(
                "x > 0",
                vec![Then::Assign(Assign {
                    variable: "y".into(),
                    value: json!("'pos'"),
                })]
            )
            .stop()
        );
        assert!(matches!(&rules[1], Rule::IfNot { otherwise: Some(actions), stop: false, .. } if actions.len() == 1));
        assert!(matches!(&rules[2], Rule::Always { then } if then.len() == 1));

        let round_trip = parse_rules(serde_json::to_value(&rules).unwrap()).unwrap();
        assert_eq!(round_trip, rules);
    }

    #[test]
    fn rejects_malformed_rules() {
        for bad in [
            json!([{"rule": "sometimes", "then": []}]),
            json!([{"rule": "condition", "then": []}]),
            json!([{"rule": "condition", "if": "a", "if_not": "b", "then": []}]),
            json!([{"rule": "always", "if": "a", "then": []}]),
            json!([{"rule": "always", "then": {"teleport": {}}}]),
            json!([{"rule": "always", "then": {"findById": {"information": "orders", "variable": "o"}}}]),
            json!([{"rule": "always", "then": {"forEach": {"variable": "xs", "then": {"findPartial": {"information": "o", "variable": "v"}}}}}]),
        ] {
            let err = parse_rules(bad.clone()).unwrap_err();
            assert!(matches!(err, Error::InvalidRule(_)), "{bad} gave {err:?}");
        }
    }

    #[test]
    fn mapping_spreads_merge_and_keeps_literals() {
        let evaluator = ExprEvaluator::new();
        let context = json!({"base": {"a": 1, "b": 2}, "extra": {"c": 3}, "n": 4});
        let mapped = map_value(
            &evaluator,
            &json!({"$merge": ["base", "extra"], "b": "n * 2", "flag": true, "list": ["n", 7]}),
            &context,
        )
        .unwrap();
        assert_eq!(
            mapped,
            json!({"a": 1, "b": 8, "c": 3, "flag": true, "list": [4, 7]})
        );
    }

    #[test]
    fn rule_filters_resolve_against_context() {
        let evaluator = ExprEvaluator::new();
        let filter: RuleFilter = serde_json::from_value(json!({
            "and": [
                {"eq": {"prop": "status", "value": "'open'"}},
                {"anyOfDocId": "ids"},
                {"not": {"exists": "archivedAt"}}
            ]
        }))
        .unwrap();
        let resolved = resolve_filter(&evaluator, &filter, &json!({"ids": ["a", 2]})).unwrap();
        assert_eq!(
            resolved,
            Filter::and(vec![
                Filter::eq("status", "open"),
                Filter::any_of_doc_id(["a", "2"]),
                Filter::negate(Filter::exists("archivedAt")),
            ])
        );
    }

    #[test]
    fn assign_path_creates_intermediate_objects() {
        let mut context = json!({"order": {"id": 1}, "n": 3});
        assign_path(&mut context, "order.totals.net", json!(10)).unwrap();
        assert_eq!(context["order"], json!({"id": 1, "totals": {"net": 10}}));
        assert!(assign_path(&mut context, "n.x", json!(1)).is_err());
    }

    #[test]
    fn registry_builds_events_and_resolves_collections() {
        let registry = Registry::new().event("OrderPlaced").information_as("orders", "doc_orders");
        let mut meta = JsonMap::new();
        meta.insert("user".into(), json!("u1"));
        let event = registry
            .build_event("OrderPlaced", json!({"id": "X"}), meta)
            .unwrap();
        assert_eq!(event.name, "OrderPlaced");
        assert_eq!(event.meta.get("user"), Some(&json!("u1")));
        assert!(matches!(
            registry.build_event("Nope", json!({}), JsonMap::new()),
            Err(Error::UnknownEventFactory(_))
        ));
        assert_eq!(registry.collection("orders").unwrap(), "doc_orders");
        assert!(registry.collection("users").is_err());
    }
}
