use super::ErrorMessage;
use crate::core::{Result, SchemaError, Value};
use crate::entity::FieldValue;
use crate::hooks::HookDefinition;
use crate::model::FieldDefinition;
use regex::Regex;
use std::cmp::Ordering;

pub const REQUIRED: &str = "commons.validate.field.error.missing";
pub const UNIQUE: &str = "commons.validate.field.error.duplicated";
pub const LENGTH: &str = "commons.validate.field.error.invalidLength";
pub const RANGE: &str = "commons.validate.field.error.outOfRange";
pub const PATTERN: &str = "commons.validate.field.error.invalidPattern";
pub const SCALE: &str = "commons.validate.field.error.invalidScale";
pub const CUSTOM: &str = "commons.validate.field.error.custom";

#[derive(Debug, Clone)]
pub enum FieldCheck {
    Required,
    /// No other row of the schema holds the same value. Needs storage, so
    /// the validation service evaluates it.
    Unique,
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    Range {
        from: Option<Value>,
        to: Option<Value>,
        inclusive: bool,
    },
    /// Whole-value match.
    Pattern(Regex),
    /// Maximum number of significant fraction digits.
    Scale { max: u32 },
    Custom(HookDefinition),
}

#[derive(Debug, Clone)]
pub struct FieldValidator {
    check: FieldCheck,
    error_message: Option<String>,
}

impl FieldValidator {
    pub fn new(check: FieldCheck) -> Self {
        Self {
            check,
            error_message: None,
        }
    }

    pub fn required() -> Self {
        Self::new(FieldCheck::Required)
    }

    pub fn unique() -> Self {
        Self::new(FieldCheck::Unique)
    }

    pub fn length(min: Option<usize>, max: Option<usize>) -> Self {
        Self::new(FieldCheck::Length { min, max })
    }

    pub fn range(from: Option<Value>, to: Option<Value>, inclusive: bool) -> Self {
        Self::new(FieldCheck::Range { from, to, inclusive })
    }

    pub fn pattern(pattern: &str) -> std::result::Result<Self, SchemaError> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|err| SchemaError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self::new(FieldCheck::Pattern(regex)))
    }

    pub fn scale(max: u32) -> Self {
        Self::new(FieldCheck::Scale { max })
    }

    pub fn custom(hook: HookDefinition) -> Self {
        Self::new(FieldCheck::Custom(hook))
    }

    pub fn custom_error_message(mut self, key: impl Into<String>) -> Self {
        self.error_message = Some(key.into());
        self
    }

    pub fn check(&self) -> &FieldCheck {
        &self.check
    }

    pub fn is_required(&self) -> bool {
        matches!(self.check, FieldCheck::Required)
    }

    pub fn is_unique(&self) -> bool {
        matches!(self.check, FieldCheck::Unique)
    }

    /// Checks a coerced value. `Unique` always passes here.
    pub fn validate(&self, field: &FieldDefinition, value: &FieldValue) -> Result<Option<ErrorMessage>> {
        if value.is_null() {
            return Ok(self.is_required().then(|| self.message(REQUIRED, Vec::new())));
        }

        let failure = match &self.check {
            FieldCheck::Required | FieldCheck::Unique => None,
            FieldCheck::Length { min, max } => match value {
                FieldValue::Text(text) => {
                    let length = text.chars().count();
                    let too_short = min.is_some_and(|min| length < min);
                    let too_long = max.is_some_and(|max| length > max);
                    (too_short || too_long).then(|| self.message(LENGTH, vec![bound(min), bound(max)]))
                }
                _ => None,
            },
            FieldCheck::Range { from, to, inclusive } => {
                let actual = field.field_type().to_storage(value)?;
                let below = match from {
                    Some(from) => out_of_bound(actual.compare(from)?, Ordering::Less, *inclusive),
                    None => false,
                };
                let above = match to {
                    Some(to) => out_of_bound(actual.compare(to)?, Ordering::Greater, *inclusive),
                    None => false,
                };
                (below || above).then(|| {
                    let args = [from, to]
                        .into_iter()
                        .map(|limit| match limit {
                            Some(v) => v.to_string(),
                            None => String::new(),
                        })
                        .collect();
                    self.message(RANGE, args)
                })
            }
            FieldCheck::Pattern(regex) => match value {
                FieldValue::Text(text) if !regex.is_match(text) => Some(self.message(PATTERN, Vec::new())),
                _ => None,
            },
            FieldCheck::Scale { max } => match value {
                FieldValue::Decimal(decimal) => {
                    let (_, scale) = decimal.normalized().as_bigint_and_exponent();
                    (scale > i64::from(*max)).then(|| self.message(SCALE, vec![max.to_string()]))
                }
                _ => None,
            },
            FieldCheck::Custom(hook) => {
                let passed = hook.call_with_field_and_get_boolean(field, value)?;
                (!passed).then(|| self.message(CUSTOM, Vec::new()))
            }
        };

        Ok(failure)
    }

    pub(crate) fn unique_violation(&self) -> ErrorMessage {
        self.message(UNIQUE, Vec::new())
    }

    fn message(&self, default_key: &str, args: Vec<String>) -> ErrorMessage {
        ErrorMessage {
            key: self.error_message.clone().unwrap_or_else(|| default_key.to_string()),
            args,
        }
    }
}

fn bound(limit: &Option<usize>) -> String {
    limit.map(|l| l.to_string()).unwrap_or_default()
}

fn out_of_bound(ordering: Ordering, outside: Ordering, inclusive: bool) -> bool {
    ordering == outside || (!inclusive && ordering == Ordering::Equal)
}
