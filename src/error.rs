use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field-level complaint raised by payload validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("concurrency conflict on stream `{stream}`: expected version {expected}, actual {actual}")]
    Concurrency {
        stream: String,
        expected: u64,
        actual: u64,
    },
    #[error("validation failed with {} error(s)", errors.len())]
    Validation { errors: Vec<FieldError> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stream `{0}` does not exist")]
    StreamNotFound(String),
    #[error("stream `{0}` already exists")]
    StreamExists(String),
    #[error("collection `{0}` does not exist")]
    CollectionNotFound(String),
    #[error("document `{id}` already exists in `{collection}`")]
    DocumentExists { collection: String, id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("session has already been committed")]
    SessionCommitted,
    #[error("no event factory registered for `{0}`")]
    UnknownEventFactory(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("rule interpreter error: {0}")]
    Interpreter(String),
    #[error("failed to evaluate `{expr}`: {reason}")]
    Expression { expr: String, reason: String },
    #[error("service error: {0}")]
    Service(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn is_concurrency(&self) -> bool {
        match self {
            Error::Concurrency { .. } => true,
            Error::Context { source, .. } => source.is_concurrency(),
            _ => false,
        }
    }

    pub(crate) fn expression(expr: &str, reason: impl Into<String>) -> Self {
        Error::Expression {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
