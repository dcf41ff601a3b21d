//! Validation pipeline.
//!
//! Validation problems are data, not errors: every failure becomes an
//! [`ErrorMessage`] attached to the entity, and a save attempt reports all of
//! them at once. Only fatal conditions (unknown schema, hook failure, storage
//! failure) surface as [`crate::core::DataError`].

pub mod entity;
pub mod field;
pub mod service;

pub use entity::{CustomEntityValidator, EntityValidator};
pub use field::{FieldCheck, FieldValidator};
pub use service::ValidationService;

use serde::Serialize;
use std::fmt;

/// A message-catalog key plus its arguments. Text lookup happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorMessage {
    pub key: String,
    pub args: Vec<String>,
}

impl ErrorMessage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(key: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}({})", self.key, self.args.join(", "))
        }
    }
}
