use super::{Entity, EntityList, LazyEntity};
use crate::core::EntityId;
use crate::types::DATE_FORMAT;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::fmt;

/// Dynamically typed content of one entity field.
///
/// Scalars double as raw input: a caller may assign `Text("12.345")` to a
/// decimal field, and the validation pipeline coerces it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    Boolean(bool),
    Date(NaiveDate),
    /// Materialized belongs-to target.
    Entity(Box<Entity>),
    /// Belongs-to target loaded on demand.
    Reference(LazyEntity),
    /// Has-many children.
    Entities(EntityList),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Text(_) | Self::Integer(_) | Self::Decimal(_) | Self::Boolean(_) | Self::Date(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::Date(_) => "date",
            Self::Entity(_) => "entity",
            Self::Reference(_) => "reference",
            Self::Entities(_) => "entity list",
        }
    }

    /// Id of the referenced entity for belongs-to values.
    pub fn reference_id(&self) -> Option<EntityId> {
        match self {
            Self::Entity(entity) => entity.id(),
            Self::Reference(reference) => Some(reference.id()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            Self::Decimal(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// The referenced entity if it is already in memory.
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Reference(reference) => reference.loaded(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&EntityList> {
        match self {
            Self::Entities(list) => Some(list),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Text(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Entity(entity) => match entity.id() {
                Some(id) => write!(f, "{}", id),
                None => write!(f, "{}#new", entity.schema().name()),
            },
            Self::Reference(reference) => write!(f, "{}", reference.id()),
            Self::Entities(list) => write!(f, "{}[{}]", list.schema_name(), list.join_field()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for FieldValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<BigDecimal> for FieldValue {
    fn from(d: BigDecimal) -> Self {
        Self::Decimal(d)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(d: NaiveDate) -> Self {
        Self::Date(d)
    }
}

impl From<Entity> for FieldValue {
    fn from(entity: Entity) -> Self {
        Self::Entity(Box::new(entity))
    }
}

impl From<LazyEntity> for FieldValue {
    fn from(reference: LazyEntity) -> Self {
        Self::Reference(reference)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}
