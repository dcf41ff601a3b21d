use super::{DataError, DataType, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Persisted entity identifier, assigned by storage on first insert.
pub type EntityId = i64;

/// One stored entity: a value per column, in column order.
pub type Row = Vec<Value>;

/// Typed storage column. Every column accepts `NULL`; required values are
/// enforced by field validators before a row reaches storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    pub fn check(&self, value: &Value) -> Result<()> {
        if self.data_type.is_compatible(value) {
            return Ok(());
        }
        Err(DataError::TypeMismatch(format!(
            "column '{}' holds {}, got {}",
            self.name,
            self.data_type,
            value.type_name()
        )))
    }
}

/// Visibility snapshot for one storage statement.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: Arc<HashSet<u64>>,
    pub aborted: Arc<HashSet<u64>>,
    pub max_tx_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_check_accepts_null_and_matching_type() {
        let column = Column::new("age", DataType::Integer);
        assert!(column.check(&Value::Null).is_ok());
        assert!(column.check(&Value::Integer(3)).is_ok());
        assert!(matches!(
            column.check(&Value::from("three")),
            Err(DataError::TypeMismatch(ref msg)) if msg.contains("age")
        ));
    }
}
