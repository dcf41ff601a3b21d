use thiserror::Error;

use super::EntityId;
use crate::hooks::ExtensionId;

/// Fatal errors. Validation problems never surface here; they are
/// accumulated on the entity as [`crate::validation::ErrorMessage`]s.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Schema '{0}' not found")]
    SchemaNotFound(String),

    #[error("Entity '{schema}' with id {id} not found")]
    EntityNotFound { schema: String, id: EntityId },

    #[error("Field '{field}' not found in schema '{schema}'")]
    FieldNotFound { schema: String, field: String },

    #[error("Null reference at '{segment}' while resolving '{path}'")]
    NullReference { path: String, segment: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Hook resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Hook {hook} failed: {source}")]
    Hook {
        hook: ExtensionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Ranking inconsistency in scope {scope}: found priorities {found:?}")]
    RankingInconsistency { scope: String, found: Vec<i64> },

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Duplicate field '{field}' in schema '{schema}'")]
    DuplicateFieldName { schema: String, field: String },

    #[error("Field '{field}' of schema '{schema}' references unresolved schema '{target}'")]
    UnresolvedFieldType {
        schema: String,
        field: String,
        target: String,
    },

    #[error("Priority field '{field}' of schema '{schema}' must be scoped on a belongs-to field, got '{scope}'")]
    InvalidPriorityScope {
        schema: String,
        field: String,
        scope: String,
    },

    #[error("Schema '{0}' declares more than one priority field")]
    MultiplePriorityFields(String),

    #[error("Schema '{0}' already registered")]
    DuplicateSchema(String),

    #[error("Invalid name '{0}'")]
    InvalidName(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No extension registered for {0}")]
    UnresolvedHook(ExtensionId),

    #[error("Extension {hook} is not a {expected} hook")]
    ContractMismatch {
        hook: ExtensionId,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, DataError>;

impl<T> From<std::sync::PoisonError<T>> for DataError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
