//! JSON-schema validation of command, event and query payloads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::{Error, FieldError, Result};

/// Validates `payload` against `schema`, collecting every failing field.
pub fn validate_payload(schema: &Value, payload: &Value) -> Result<()> {
    let validator = compile(schema)?;
    check(&validator, payload)
}

fn compile(schema: &Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(schema).map_err(|err| Error::Validation {
        errors: vec![FieldError::new("", format!("invalid schema: {err}"))],
    })
}

fn check(validator: &jsonschema::Validator, payload: &Value) -> Result<()> {
    let errors: Vec<FieldError> = validator
        .iter_errors(payload)
        .map(|err| FieldError::new(err.instance_path.to_string(), err.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { errors })
    }
}

/// Compiled schemas keyed by command, event or query name.
#[derive(Default, Clone)]
pub struct SchemaRegistry {
    schemas: Arc<RwLock<HashMap<String, Arc<jsonschema::Validator>>>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("SchemaRegistry").field("names", &names).finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and stores `schema`, replacing any previous one for `name`.
    pub fn register(&self, name: impl Into<String>, schema: &Value) -> Result<()> {
        let validator = compile(schema)?;
        self.schemas.write().insert(name.into(), Arc::new(validator));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    /// Payloads of unregistered names pass.
    pub fn validate(&self, name: &str, payload: &Value) -> Result<()> {
        let validator = self.schemas.read().get(name).cloned();
        match validator {
            Some(validator) => check(&validator, payload),
            None => Ok(()),
        }
    }
}
