//! Runtime field types: the closed set of value kinds a schema field can hold,
//! with per-kind coercion, type-level validation, storage mapping and display.

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::NaiveDate;
use std::str::FromStr;

use crate::core::{DataError, DataType, Result, Value};
use crate::entity::{FieldValue, LazyEntity};
use crate::model::SchemaRegistry;
use crate::validation::ErrorMessage;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_DECIMAL_SCALE: u32 = 5;

pub const WRONG_TYPE: &str = "commons.validate.field.error.wrongType";
pub const INVALID_NUMERIC_FORMAT: &str = "commons.validate.field.error.invalidNumericFormat";
pub const INVALID_DATE_FORMAT: &str = "commons.validate.field.error.invalidDateFormat";
pub const STRING_TOO_LONG: &str = "commons.validate.field.error.stringIsTooLong";
pub const BELONGS_TO_NOT_FOUND: &str = "commons.validate.field.error.belongsToNotFound";

/// Outcome of coercing one raw value: the typed value, or the field error to record.
pub type Coercion = std::result::Result<FieldValue, ErrorMessage>;

/// What happens to has-many children when their parent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cascade {
    /// Clear the children's back-reference.
    #[default]
    Nullify,
    /// Delete the children too.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Decimal { scale: u32 },
    Boolean,
    Date,
    BelongsTo {
        target: String,
        display_field: String,
        eager: bool,
    },
    HasMany {
        target: String,
        join_field: String,
        cascade: Cascade,
    },
    Priority { scope_field: String },
}

impl FieldType {
    pub fn string() -> Self {
        Self::String
    }

    pub fn integer() -> Self {
        Self::Integer
    }

    pub fn decimal(scale: u32) -> Self {
        Self::Decimal { scale }
    }

    pub fn decimal_default() -> Self {
        Self::Decimal {
            scale: DEFAULT_DECIMAL_SCALE,
        }
    }

    pub fn boolean() -> Self {
        Self::Boolean
    }

    pub fn date() -> Self {
        Self::Date
    }

    pub fn eager_belongs_to(target: impl Into<String>, display_field: impl Into<String>) -> Self {
        Self::BelongsTo {
            target: target.into(),
            display_field: display_field.into(),
            eager: true,
        }
    }

    pub fn lazy_belongs_to(target: impl Into<String>, display_field: impl Into<String>) -> Self {
        Self::BelongsTo {
            target: target.into(),
            display_field: display_field.into(),
            eager: false,
        }
    }

    pub fn has_many(target: impl Into<String>, join_field: impl Into<String>) -> Self {
        Self::HasMany {
            target: target.into(),
            join_field: join_field.into(),
            cascade: Cascade::default(),
        }
    }

    pub fn has_many_with_cascade(
        target: impl Into<String>,
        join_field: impl Into<String>,
        cascade: Cascade,
    ) -> Self {
        Self::HasMany {
            target: target.into(),
            join_field: join_field.into(),
            cascade,
        }
    }

    pub fn priority(scope_field: impl Into<String>) -> Self {
        Self::Priority {
            scope_field: scope_field.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Decimal { .. } => "decimal",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::BelongsTo { .. } => "belongsTo",
            Self::HasMany { .. } => "hasMany",
            Self::Priority { .. } => "priority",
        }
    }

    /// Storage column type; `None` for kinds that are not stored on the row.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::String => Some(DataType::Text),
            Self::Integer | Self::Priority { .. } | Self::BelongsTo { .. } => Some(DataType::Integer),
            Self::Decimal { .. } => Some(DataType::Decimal),
            Self::Boolean => Some(DataType::Boolean),
            Self::Date => Some(DataType::Date),
            Self::HasMany { .. } => None,
        }
    }

    /// Schema name a relation points at.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::BelongsTo { target, .. } | Self::HasMany { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_belongs_to(&self) -> bool {
        matches!(self, Self::BelongsTo { .. })
    }

    /// Whether `value` has the right shape to be assigned to a field of this
    /// type before coercion. Scalars accept any scalar raw input.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (_, FieldValue::Null) => true,
            (Self::BelongsTo { .. }, v) => matches!(
                v,
                FieldValue::Integer(_) | FieldValue::Text(_) | FieldValue::Entity(_) | FieldValue::Reference(_)
            ),
            (Self::HasMany { .. }, v) => matches!(v, FieldValue::Entities(_)),
            (_, v) => v.is_scalar(),
        }
    }

    /// Converts a raw value into this type's canonical value. Relation targets
    /// are resolved through `registry`; an unknown target is fatal, a
    /// malformed value is a field error.
    pub fn coerce(&self, raw: FieldValue, registry: &SchemaRegistry) -> Result<Coercion> {
        if raw.is_null() {
            return Ok(Ok(FieldValue::Null));
        }

        let coerced = match self {
            Self::String => coerce_string(raw),
            Self::Integer | Self::Priority { .. } => coerce_integer(raw),
            Self::Decimal { scale } => coerce_decimal(raw, *scale),
            Self::Boolean => coerce_boolean(raw),
            Self::Date => coerce_date(raw),
            Self::BelongsTo { target, eager, .. } => {
                let target_definition = registry.get(target)?;
                match raw {
                    FieldValue::Integer(id) => Ok(FieldValue::Reference(LazyEntity::new(target_definition, id))),
                    FieldValue::Text(text) => match text.trim().parse::<i64>() {
                        Ok(id) => Ok(FieldValue::Reference(LazyEntity::new(target_definition, id))),
                        Err(_) => Err(ErrorMessage::new(WRONG_TYPE)),
                    },
                    FieldValue::Entity(entity) => match entity.id() {
                        Some(_) if entity.schema().name() == target.as_str() => {
                            if *eager {
                                Ok(FieldValue::Entity(entity))
                            } else {
                                LazyEntity::with_entity(*entity)
                                    .map(FieldValue::Reference)
                                    .ok_or_else(|| ErrorMessage::new(WRONG_TYPE))
                            }
                        }
                        _ => Err(ErrorMessage::new(WRONG_TYPE)),
                    },
                    FieldValue::Reference(reference) if reference.schema_name() == target.as_str() => {
                        Ok(FieldValue::Reference(reference))
                    }
                    _ => Err(ErrorMessage::new(WRONG_TYPE)),
                }
            }
            Self::HasMany { .. } => match raw {
                FieldValue::Entities(list) => Ok(FieldValue::Entities(list)),
                _ => Err(ErrorMessage::new(WRONG_TYPE)),
            },
        };

        Ok(coerced)
    }

    /// Type-level rule applied after coercion.
    pub fn validate(&self, value: &FieldValue, max_string_length: usize) -> Option<ErrorMessage> {
        match (self, value) {
            (Self::String, FieldValue::Text(text)) if text.chars().count() > max_string_length => {
                Some(ErrorMessage::with_args(STRING_TOO_LONG, [max_string_length.to_string()]))
            }
            _ => None,
        }
    }

    /// Storage representation of a coerced value.
    /// Storage form of a search value. Decimals keep their full precision
    /// here, so `10.004` never equals a stored `10.00`.
    pub fn to_criteria(
        &self,
        raw: FieldValue,
        registry: &SchemaRegistry,
    ) -> Result<std::result::Result<Value, ErrorMessage>> {
        if matches!(self, Self::Decimal { .. }) && !raw.is_null() {
            return Ok(decimal_input(raw).map(Value::Decimal));
        }
        match self.coerce(raw, registry)? {
            Ok(coerced) => self.to_storage(&coerced).map(Ok),
            Err(error) => Ok(Err(error)),
        }
    }

    pub fn to_storage(&self, value: &FieldValue) -> Result<Value> {
        let stored = match (self, value) {
            (_, FieldValue::Null) => Value::Null,
            (Self::String, FieldValue::Text(s)) => Value::Text(s.clone()),
            (Self::Integer | Self::Priority { .. }, FieldValue::Integer(i)) => Value::Integer(*i),
            (Self::Decimal { scale }, FieldValue::Decimal(d)) => Value::Decimal(round(d, *scale)),
            (Self::Boolean, FieldValue::Boolean(b)) => Value::Boolean(*b),
            (Self::Date, FieldValue::Date(d)) => Value::Date(*d),
            (Self::BelongsTo { .. }, value) => match value.reference_id() {
                Some(id) => Value::Integer(id),
                None => {
                    return Err(DataError::TypeMismatch(
                        "belongs-to value has no persisted id".to_string(),
                    ));
                }
            },
            (field_type, value) => {
                return Err(DataError::TypeMismatch(format!(
                    "{} field cannot store {}",
                    field_type.name(),
                    value.kind_name()
                )));
            }
        };
        Ok(stored)
    }

    /// Scalar field value for a stored column. Relations are materialized by
    /// the data access layer, which knows the transaction to load them in.
    pub fn from_storage(&self, value: Value) -> Result<FieldValue> {
        Ok(match (self, value) {
            (_, Value::Null) => FieldValue::Null,
            (Self::String, Value::Text(s)) => FieldValue::Text(s),
            (Self::Integer | Self::Priority { .. } | Self::BelongsTo { .. }, Value::Integer(i)) => FieldValue::Integer(i),
            (Self::Decimal { .. }, Value::Decimal(d)) => FieldValue::Decimal(d),
            (Self::Boolean, Value::Boolean(b)) => FieldValue::Boolean(b),
            (Self::Date, Value::Date(d)) => FieldValue::Date(d),
            (field_type, value) => {
                return Err(DataError::TypeMismatch(format!(
                    "{} field cannot load {}",
                    field_type.name(),
                    value.type_name()
                )));
            }
        })
    }

    pub fn to_display_string(&self, value: &FieldValue) -> String {
        match (self, value) {
            (_, FieldValue::Null) => String::new(),
            (Self::Decimal { scale }, FieldValue::Decimal(d)) => round(d, *scale).to_string(),
            (Self::BelongsTo { display_field, .. }, FieldValue::Entity(entity)) => entity.display(display_field),
            (Self::BelongsTo { display_field, .. }, FieldValue::Reference(reference)) => match reference.loaded() {
                Some(entity) => entity.display(display_field),
                None => reference.id().to_string(),
            },
            (_, value) => value.to_string(),
        }
    }
}

/// Half-up rounding to a fixed scale. Applied on every write.
pub fn round(value: &BigDecimal, scale: u32) -> BigDecimal {
    value.with_scale_round(scale as i64, RoundingMode::HalfUp)
}

fn coerce_string(raw: FieldValue) -> Coercion {
    match raw {
        FieldValue::Text(s) => Ok(FieldValue::Text(s)),
        other if other.is_scalar() => Ok(FieldValue::Text(other.to_string())),
        _ => Err(ErrorMessage::new(WRONG_TYPE)),
    }
}

fn coerce_integer(raw: FieldValue) -> Coercion {
    match raw {
        FieldValue::Integer(i) => Ok(FieldValue::Integer(i)),
        FieldValue::Decimal(d) if d.is_integer() => d
            .to_i64()
            .map(FieldValue::Integer)
            .ok_or_else(|| ErrorMessage::new(INVALID_NUMERIC_FORMAT)),
        FieldValue::Decimal(_) => Err(ErrorMessage::new(INVALID_NUMERIC_FORMAT)),
        FieldValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| ErrorMessage::new(INVALID_NUMERIC_FORMAT)),
        _ => Err(ErrorMessage::new(WRONG_TYPE)),
    }
}

fn coerce_decimal(raw: FieldValue, scale: u32) -> Coercion {
    decimal_input(raw).map(|value| FieldValue::Decimal(round(&value, scale)))
}

fn decimal_input(raw: FieldValue) -> std::result::Result<BigDecimal, ErrorMessage> {
    match raw {
        FieldValue::Decimal(d) => Ok(d),
        FieldValue::Integer(i) => Ok(BigDecimal::from(i)),
        FieldValue::Text(s) => BigDecimal::from_str(s.trim()).map_err(|_| ErrorMessage::new(INVALID_NUMERIC_FORMAT)),
        _ => Err(ErrorMessage::new(WRONG_TYPE)),
    }
}

fn coerce_boolean(raw: FieldValue) -> Coercion {
    match raw {
        FieldValue::Boolean(b) => Ok(FieldValue::Boolean(b)),
        FieldValue::Integer(0) => Ok(FieldValue::Boolean(false)),
        FieldValue::Integer(1) => Ok(FieldValue::Boolean(true)),
        FieldValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(FieldValue::Boolean(true)),
            "false" | "0" => Ok(FieldValue::Boolean(false)),
            _ => Err(ErrorMessage::new(WRONG_TYPE)),
        },
        _ => Err(ErrorMessage::new(WRONG_TYPE)),
    }
}

fn coerce_date(raw: FieldValue) -> Coercion {
    match raw {
        FieldValue::Date(d) => Ok(FieldValue::Date(d)),
        FieldValue::Text(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(FieldValue::Date)
            .map_err(|_| ErrorMessage::new(INVALID_DATE_FORMAT)),
        _ => Err(ErrorMessage::new(WRONG_TYPE)),
    }
}
