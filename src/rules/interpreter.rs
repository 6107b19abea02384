use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map as JsonMap, Value};
use tracing::instrument;

use super::{
    Call, CommandDispatcher, DocChange, DocDelete, DocWrite, Evaluator, ForEach, Log, LogLevel,
    Query, Registry, Rule, ServiceRegistry, Then, assign_path, doc_id, expr::ExprEvaluator,
    map_value, resolve_filter,
};
use crate::{
    Error, Result,
    documents::{DocumentStore, FindOptions, PartialSelect},
    filter::Filter,
    identity::IdentityService,
    session::Session,
    validation::SchemaRegistry,
};

const ITEM: &str = "item";
const ITEM_KEY: &str = "itemKey";

#[derive(Default)]
pub struct InterpreterBuilder {
    evaluator: Option<Arc<dyn Evaluator>>,
    registry: Registry,
    services: Option<Arc<dyn ServiceRegistry>>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    identity: Option<Arc<dyn IdentityService>>,
    documents: Option<Arc<dyn DocumentStore>>,
    schemas: SchemaRegistry,
}

impl InterpreterBuilder {
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn services(mut self, services: Arc<dyn ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityService>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Command payload schemas checked by [`Interpreter::execute_command`].
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn build(self) -> Interpreter {
        Interpreter {
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(ExprEvaluator::new())),
            registry: self.registry,
            services: self.services,
            dispatcher: self.dispatcher,
            identity: self.identity,
            documents: self.documents,
            schemas: self.schemas,
        }
    }
}

/// Runs rule lists against a JSON object context.
///
/// A rule either continues to the next rule or ends the run. `always` rules
/// continue. A condition that holds continues unless it has `stop`. A
/// condition that does not hold runs its `else` branch and continues; with
/// no `else` the run fails with [`Error::Interpreter`].
pub struct Interpreter {
    evaluator: Arc<dyn Evaluator>,
    registry: Registry,
    services: Option<Arc<dyn ServiceRegistry>>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    identity: Option<Arc<dyn IdentityService>>,
    documents: Option<Arc<dyn DocumentStore>>,
    schemas: SchemaRegistry,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("registry", &self.registry)
            .field("services", &self.services.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .field("identity", &self.identity.is_some())
            .field("documents", &self.documents.is_some())
            .field("schemas", &self.schemas)
            .finish()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Interpreter {
    pub fn builder() -> InterpreterBuilder {
        InterpreterBuilder::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs `rules` with the full action vocabulary. Document writes are
    /// staged on `session` when one is given, applied directly otherwise.
    pub async fn execute(
        &self,
        rules: &[Rule],
        context: Value,
        session: Option<&mut Session>,
    ) -> Result<Value> {
        self.run(rules, object_context(context)?, session).await
    }

    /// Validates `payload` against the schema registered for `command`, then
    /// runs `rules` with `command` and `payload` bound in the context.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute_command(
        &self,
        command: &str,
        payload: Value,
        rules: &[Rule],
        session: Option<&mut Session>,
    ) -> Result<Value> {
        self.schemas.validate(command, &payload)?;
        let mut context = JsonMap::new();
        context.insert("command".to_string(), Value::from(command));
        context.insert("payload".to_string(), payload);
        self.run(rules, Value::Object(context), session).await
    }

    /// Runs `rules` without I/O. Only `assign`, `record`, `filter`,
    /// `forEach`, `execute`, `log` and synchronous `call` are available.
    pub fn execute_sync(&self, rules: &[Rule], context: Value) -> Result<Value> {
        let mut context = object_context(context)?;
        for rule in rules {
            let (actions, proceed) = self.branch(rule, &context)?;
            for action in actions {
                context = self.apply_sync(action, context)?;
            }
            if !proceed {
                break;
            }
        }
        Ok(context)
    }

    fn branch<'r>(&self, rule: &'r Rule, context: &Value) -> Result<(&'r [Then], bool)> {
        match rule {
            Rule::Always { then } => Ok((then.as_slice(), true)),
            Rule::If {
                condition,
                then,
                otherwise,
                stop,
            }
            | Rule::IfNot {
                condition,
                then,
                otherwise,
                stop,
            } => {
                let negated = matches!(rule, Rule::IfNot { .. });
                let holds = self.evaluator.test(condition, context)? != negated;
                tracing::trace!(target: "docket::rules", condition = %condition, negated, holds, "evaluated rule condition");
                match (holds, otherwise) {
                    (true, _) => Ok((then.as_slice(), !stop)),
                    (false, Some(otherwise)) => Ok((otherwise.as_slice(), true)),
                    (false, None) => Err(Error::Interpreter(format!(
                        "condition `{condition}` did not select a branch and the rule has no else"
                    ))),
                }
            }
        }
    }

    fn run<'a>(
        &'a self,
        rules: &'a [Rule],
        context: Value,
        mut session: Option<&'a mut Session>,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            let mut context = context;
            for rule in rules {
                let (actions, proceed) = self.branch(rule, &context)?;
                context = self
                    .apply_all(actions, context, session.as_deref_mut())
                    .await?;
                if !proceed {
                    break;
                }
            }
            Ok(context)
        }
        .boxed()
    }

    fn apply_all<'a>(
        &'a self,
        actions: &'a [Then],
        context: Value,
        mut session: Option<&'a mut Session>,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            let mut context = context;
            for action in actions {
                context = self
                    .apply(action, context, session.as_deref_mut())
                    .await?;
            }
            Ok(context)
        }
        .boxed()
    }

    async fn apply(
        &self,
        action: &Then,
        mut context: Value,
        session: Option<&mut Session>,
    ) -> Result<Value> {
        match action {
            Then::Call(call) if call.is_async => {
                let reply = self
                    .services()?
                    .call_async(&call.service, &call.method, self.arguments(call, &context)?)
                    .await?;
                self.store_reply(call, reply, &mut context)?;
            }
            Then::Trigger(trigger) => {
                let payload = map_value(self.evaluator(), &trigger.mapping, &context)?;
                let meta = match &trigger.meta {
                    Some(meta) => map_value(self.evaluator(), meta, &context)?,
                    None => Value::Object(JsonMap::new()),
                };
                let reply = self
                    .dispatcher()?
                    .dispatch(&trigger.command, payload, meta)
                    .await?;
                if let Some(variable) = &trigger.variable {
                    assign_path(&mut context, variable, reply)?;
                }
            }
            Then::Find(query)
            | Then::FindOne(query)
            | Then::FindPartial(query)
            | Then::FindOnePartial(query)
            | Then::FindById(query)
            | Then::FindPartialById(query)
            | Then::Count(query) => {
                let found = self.query(action, query, &context).await?;
                assign_path(&mut context, &query.variable, found)?;
            }
            Then::Insert(write) | Then::Upsert(write) => {
                self.write_doc(action, write, &context, session).await?;
            }
            Then::Update(change) | Then::Replace(change) => {
                self.change_docs(action, change, &context, session).await?;
            }
            Then::Delete(delete) => self.delete_docs(delete, &context, session).await?,
            Then::LookupUser(lookup) => {
                let id = doc_id(&self.evaluator.evaluate(&lookup.user, &context)?)?;
                let user = self.identity()?.get(&id).await?.unwrap_or(Value::Null);
                assign_path(&mut context, &lookup.variable, user)?;
            }
            Then::LookupUsers(lookup) => {
                let filter = self.filter_or_any(lookup.filter.as_ref(), &context)?;
                let users = self.identity()?.find(&filter).await?;
                assign_path(&mut context, &lookup.variable, Value::Array(users))?;
            }
            Then::ForEach(each) => {
                let mut session = session;
                let saved = Saved::take(&mut context);
                for (key, item) in self.items(each, &context)? {
                    bind_item(&mut context, key, item);
                    context = self
                        .apply_all(&each.then, context, session.as_deref_mut())
                        .await?;
                }
                saved.restore(&mut context);
            }
            Then::Execute(execute) => {
                context = self.run(&execute.rules, context, session).await?;
            }
            local => context = self.apply_local(local, context)?,
        }
        Ok(context)
    }

    fn apply_sync(&self, action: &Then, mut context: Value) -> Result<Value> {
        match action {
            Then::ForEach(each) => {
                let saved = Saved::take(&mut context);
                for (key, item) in self.items(each, &context)? {
                    bind_item(&mut context, key, item);
                    for nested in &each.then {
                        context = self.apply_sync(nested, context)?;
                    }
                }
                saved.restore(&mut context);
                Ok(context)
            }
            Then::Execute(execute) => self.execute_sync(&execute.rules, context),
            other => self.apply_local(other, context),
        }
    }

    // Actions that touch nothing but the context and synchronous services.
    fn apply_local(&self, action: &Then, mut context: Value) -> Result<Value> {
        match action {
            Then::Assign(assign) => {
                let value = map_value(self.evaluator(), &assign.value, &context)?;
                assign_path(&mut context, &assign.variable, value)?;
            }
            Then::Record(record) => {
                let payload = map_value(self.evaluator(), &record.mapping, &context)?;
                let meta = match &record.meta {
                    None => JsonMap::new(),
                    Some(meta) => match map_value(self.evaluator(), meta, &context)? {
                        Value::Object(meta) => meta,
                        Value::Null => JsonMap::new(),
                        other => {
                            return Err(Error::Interpreter(format!(
                                "event meta for `{}` must be an object, got {other}",
                                record.event
                            )));
                        }
                    },
                };
                let event = self.registry.build_event(&record.event, payload, meta)?;
                assign_path(&mut context, "event", serde_json::to_value(&event)?)?;
            }
            Then::Filter(filter) => {
                let filter = resolve_filter(self.evaluator(), filter, &context)?;
                assign_path(&mut context, "filter", serde_json::to_value(&filter)?)?;
            }
            Then::Log(log) => self.log(log, &context)?,
            Then::Call(call) if !call.is_async => {
                let reply = self.services()?.call(
                    &call.service,
                    &call.method,
                    self.arguments(call, &context)?,
                )?;
                self.store_reply(call, reply, &mut context)?;
            }
            other => {
                return Err(Error::Interpreter(format!(
                    "`{}` is not available in synchronous mode",
                    other.kind()
                )));
            }
        }
        Ok(context)
    }

    fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    fn services(&self) -> Result<&dyn ServiceRegistry> {
        self.services
            .as_deref()
            .ok_or_else(|| missing_collaborator("service registry"))
    }

    fn dispatcher(&self) -> Result<&dyn CommandDispatcher> {
        self.dispatcher
            .as_deref()
            .ok_or_else(|| missing_collaborator("command dispatcher"))
    }

    fn identity(&self) -> Result<&dyn IdentityService> {
        self.identity
            .as_deref()
            .ok_or_else(|| missing_collaborator("identity service"))
    }

    fn documents(&self) -> Result<&dyn DocumentStore> {
        self.documents
            .as_deref()
            .ok_or_else(|| missing_collaborator("document store"))
    }

    fn arguments(&self, call: &Call, context: &Value) -> Result<Vec<Value>> {
        call.arguments
            .iter()
            .map(|argument| map_value(self.evaluator(), argument, context))
            .collect()
    }

    fn store_reply(&self, call: &Call, reply: Value, context: &mut Value) -> Result<()> {
        let Some(result) = &call.result else {
            return Ok(());
        };
        let value = match &result.mapping {
            None => reply,
            Some(mapping) => {
                let mut scope = context.clone();
                assign_path(&mut scope, "result", reply)?;
                map_value(self.evaluator(), mapping, &scope)?
            }
        };
        assign_path(context, &result.variable, value)
    }

    fn log(&self, log: &Log, context: &Value) -> Result<()> {
        let message = match map_value(self.evaluator(), &log.msg, context)? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        match log.level {
            LogLevel::Trace => tracing::trace!(target: "docket::rules", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "docket::rules", "{message}"),
            LogLevel::Info => tracing::info!(target: "docket::rules", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "docket::rules", "{message}"),
            LogLevel::Error => tracing::error!(target: "docket::rules", "{message}"),
        }
        Ok(())
    }

    fn filter_or_any(&self, filter: Option<&super::RuleFilter>, context: &Value) -> Result<Filter> {
        match filter {
            Some(filter) => resolve_filter(self.evaluator(), filter, context),
            None => Ok(Filter::Any),
        }
    }

    fn items(&self, each: &ForEach, context: &Value) -> Result<Vec<(Value, Value)>> {
        match self.evaluator.evaluate(&each.variable, context)? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (Value::from(index), item))
                .collect()),
            Value::Object(fields) => Ok(fields
                .into_iter()
                .map(|(key, item)| (Value::String(key), item))
                .collect()),
            other => Err(Error::Interpreter(format!(
                "`forEach` over `{}` needs an array or object, got {other}",
                each.variable
            ))),
        }
    }

    fn find_options(&self, query: &Query, context: &Value) -> Result<FindOptions> {
        let count = |mapping: &Option<Value>, name: &str| -> Result<Option<usize>> {
            let Some(mapping) = mapping else {
                return Ok(None);
            };
            match map_value(self.evaluator(), mapping, context)? {
                Value::Null => Ok(None),
                value => value
                    .as_u64()
                    .map(|n| Some(n as usize))
                    .ok_or_else(|| {
                        Error::Interpreter(format!("`{name}` must be a non-negative integer, got {value}"))
                    }),
            }
        };
        Ok(FindOptions {
            skip: count(&query.skip, "skip")?,
            limit: count(&query.limit, "limit")?,
            order_by: query.order_by.clone(),
        })
    }

    async fn query(&self, action: &Then, query: &Query, context: &Value) -> Result<Value> {
        let documents = self.documents()?;
        let collection = self.registry.collection(&query.information)?;
        let select = query.select.clone().unwrap_or_else(PartialSelect::new);

        if let Then::FindById(_) | Then::FindPartialById(_) = action {
            let expr = query.id.as_deref().unwrap_or_default();
            let id = doc_id(&self.evaluator.evaluate(expr, context)?)?;
            let found = match action {
                Then::FindById(_) => documents.get_doc(collection, &id).await?,
                _ => documents.get_partial_doc(collection, &id, &select).await?,
            };
            return Ok(found.unwrap_or(Value::Null));
        }

        let filter = self.filter_or_any(query.filter.as_ref(), context)?;
        if let Then::Count(_) = action {
            return Ok(Value::from(documents.count_docs(collection, &filter).await?));
        }

        let mut options = self.find_options(query, context)?;
        let single = matches!(action, Then::FindOne(_) | Then::FindOnePartial(_));
        if single {
            options.limit = Some(1);
        }
        let found = match action {
            Then::FindPartial(_) | Then::FindOnePartial(_) => {
                documents
                    .find_partial_docs(collection, &select, &filter, &options)
                    .await?
            }
            _ => documents.find_docs(collection, &filter, &options).await?,
        };
        let mut docs = found.into_iter().map(|(_, doc)| doc);
        Ok(if single {
            docs.next().unwrap_or(Value::Null)
        } else {
            Value::Array(docs.collect())
        })
    }

    async fn write_doc(
        &self,
        action: &Then,
        write: &DocWrite,
        context: &Value,
        session: Option<&mut Session>,
    ) -> Result<()> {
        let collection = self.registry.collection(&write.information)?;
        let id = doc_id(&self.evaluator.evaluate(&write.id, context)?)?;
        let data = map_value(self.evaluator(), &write.data, context)?;
        let upsert = matches!(action, Then::Upsert(_));
        match session {
            Some(session) if upsert => session.upsert_doc(collection, id, data),
            Some(session) => session.insert_doc(collection, id, data),
            None if upsert => self.documents()?.upsert_doc(collection, &id, data).await,
            None => self.documents()?.add_doc(collection, &id, data).await,
        }
    }

    async fn change_docs(
        &self,
        action: &Then,
        change: &DocChange,
        context: &Value,
        session: Option<&mut Session>,
    ) -> Result<()> {
        let collection = self.registry.collection(&change.information)?;
        let filter = resolve_filter(self.evaluator(), &change.filter, context)?;
        let set = map_value(self.evaluator(), &change.set, context)?;
        let replace = matches!(action, Then::Replace(_));
        match session {
            Some(session) if replace => session.replace_many(collection, filter, set),
            Some(session) => session.update_many(collection, filter, set),
            None if replace => self
                .documents()?
                .replace_many(collection, &filter, set)
                .await
                .map(drop),
            None => self
                .documents()?
                .update_many(collection, &filter, set)
                .await
                .map(drop),
        }
    }

    async fn delete_docs(
        &self,
        delete: &DocDelete,
        context: &Value,
        session: Option<&mut Session>,
    ) -> Result<()> {
        let collection = self.registry.collection(&delete.information)?;
        let filter = resolve_filter(self.evaluator(), &delete.filter, context)?;
        match session {
            Some(session) => session.delete_many(collection, filter),
            None => self
                .documents()?
                .delete_many(collection, &filter)
                .await
                .map(drop),
        }
    }
}

fn missing_collaborator(name: &str) -> Error {
    Error::Interpreter(format!("no {name} configured"))
}

fn object_context(context: Value) -> Result<Value> {
    match context {
        Value::Null => Ok(Value::Object(JsonMap::new())),
        Value::Object(_) => Ok(context),
        other => Err(Error::Interpreter(format!(
            "execution context must be an object, got {other}"
        ))),
    }
}

fn bind_item(context: &mut Value, key: Value, item: Value) {
    if let Value::Object(fields) = context {
        fields.insert(ITEM.to_string(), item);
        fields.insert(ITEM_KEY.to_string(), key);
    }
}

/// `item` and `itemKey` as they were before a `forEach`.
struct Saved {
    item: Option<Value>,
    item_key: Option<Value>,
}

impl Saved {
    fn take(context: &mut Value) -> Self {
        let fields = context.as_object();
        Saved {
            item: fields.and_then(|f| f.get(ITEM).cloned()),
            item_key: fields.and_then(|f| f.get(ITEM_KEY).cloned()),
        }
    }

    fn restore(self, context: &mut Value) {
        let Value::Object(fields) = context else {
            return;
        };
        for (name, saved) in [(ITEM, self.item), (ITEM_KEY, self.item_key)] {
            match saved {
                Some(value) => {
                    fields.insert(name.to_string(), value);
                }
                None => {
                    fields.remove(name);
                }
            }
        }
    }
}
