//! Runtime entity container.
//!
//! An [`Entity`] is one record of a schema: a nullable id, field values keyed
//! by name, and the errors attached by the last validation pass. Every
//! assignment is checked against the field's declared kind; business rules
//! are left to the validation pipeline.

pub mod relation;
pub mod value;

pub use relation::{EntityList, LazyEntity};
pub use value::FieldValue;

use crate::core::{DataError, EntityId, Result};
use crate::model::DataDefinition;
use crate::validation::ErrorMessage;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

const NULL: &FieldValue = &FieldValue::Null;

#[derive(Clone)]
pub struct Entity {
    definition: Arc<DataDefinition>,
    id: Option<EntityId>,
    values: HashMap<String, FieldValue>,
    // Stored fields left out of a projected read.
    unloaded: BTreeSet<String>,
    global_errors: Vec<ErrorMessage>,
    field_errors: BTreeMap<String, Vec<ErrorMessage>>,
}

impl Entity {
    /// Empty entity with every field unset. See [`DataDefinition::create`]
    /// for one with defaults applied.
    pub fn new(definition: Arc<DataDefinition>) -> Self {
        Self {
            definition,
            id: None,
            values: HashMap::new(),
            unloaded: BTreeSet::new(),
            global_errors: Vec::new(),
            field_errors: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<DataDefinition> {
        &self.definition
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn set_id(&mut self, id: Option<EntityId>) {
        self.id = id;
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    /// Value of a field of this schema; unset fields read as `Null`.
    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.definition.get_field(field)?;
        Ok(self.values.get(field).unwrap_or(NULL))
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let definition = self.definition.get_field(field)?;
        if !definition.field_type().accepts(&value) {
            return Err(DataError::TypeMismatch(format!(
                "field '{}' of '{}' is {}, cannot hold {} value",
                field,
                self.definition.name(),
                definition.field_type().name(),
                value.kind_name()
            )));
        }
        self.unloaded.remove(field);
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get_str(&self, field: &str) -> Result<Option<&str>> {
        Ok(self.get(field)?.as_str())
    }

    pub fn get_integer(&self, field: &str) -> Result<Option<i64>> {
        Ok(self.get(field)?.as_i64())
    }

    pub fn get_decimal(&self, field: &str) -> Result<Option<&BigDecimal>> {
        Ok(self.get(field)?.as_decimal())
    }

    pub fn get_bool(&self, field: &str) -> Result<Option<bool>> {
        Ok(self.get(field)?.as_bool())
    }

    pub fn get_date(&self, field: &str) -> Result<Option<NaiveDate>> {
        Ok(self.get(field)?.as_date())
    }

    pub fn get_entity(&self, field: &str) -> Result<Option<&Entity>> {
        Ok(self.get(field)?.as_entity())
    }

    pub fn get_list(&self, field: &str) -> Result<Option<&EntityList>> {
        Ok(self.get(field)?.as_list())
    }

    /// Follows a dotted belongs-to path such as `order.product.name` through
    /// references already in memory.
    pub fn get_path(&self, path: &str) -> Result<FieldValue> {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Ok(value.clone());
            }
            current = match value {
                FieldValue::Reference(reference) => reference.loaded().ok_or_else(|| {
                    DataError::TypeMismatch(format!(
                        "reference '{}' in '{}' is not loaded, use resolve_path",
                        segment, path
                    ))
                })?,
                other => step(other, path, segment)?,
            };
        }
        Err(self.field_not_found(path))
    }

    /// Like [`Entity::get_path`], loading lazy references on the way.
    pub async fn resolve_path(&self, path: &str) -> Result<FieldValue> {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Ok(value.clone());
            }
            current = match value {
                FieldValue::Reference(reference) => reference.load().await?,
                other => step(other, path, segment)?,
            };
        }
        Err(self.field_not_found(path))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.definition
            .fields()
            .iter()
            .map(|field| (field.name(), self.values.get(field.name()).unwrap_or(NULL)))
    }

    /// Display form of a field, empty for unknown fields.
    pub fn display(&self, field: &str) -> String {
        match (self.definition.field(field), self.values.get(field)) {
            (Some(definition), Some(value)) => definition.field_type().to_display_string(value),
            _ => String::new(),
        }
    }

    /// False for a stored field that a projected search did not read.
    pub fn is_loaded(&self, field: &str) -> bool {
        !self.unloaded.contains(field)
    }

    pub fn is_partial(&self) -> bool {
        !self.unloaded.is_empty()
    }

    pub fn add_global_error(&mut self, error: ErrorMessage) {
        self.global_errors.push(error);
    }

    pub fn add_field_error(&mut self, field: &str, error: ErrorMessage) {
        self.field_errors.entry(field.to_string()).or_default().push(error);
    }

    pub fn global_errors(&self) -> &[ErrorMessage] {
        &self.global_errors
    }

    pub fn field_errors(&self) -> &BTreeMap<String, Vec<ErrorMessage>> {
        &self.field_errors
    }

    pub fn field_error(&self, field: &str) -> &[ErrorMessage] {
        self.field_errors.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn error_count(&self) -> usize {
        self.global_errors.len() + self.field_errors.values().map(Vec::len).sum::<usize>()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Valid iff the last validation pass attached no error.
    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    /// Display form as a JSON object; references render as ids.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        object.insert("id".to_string(), self.id.map(JsonValue::from).unwrap_or(JsonValue::Null));
        for (name, value) in self.fields() {
            let json = match value {
                FieldValue::Entities(_) => continue,
                FieldValue::Null => JsonValue::Null,
                FieldValue::Integer(i) => JsonValue::from(*i),
                FieldValue::Boolean(b) => JsonValue::Bool(*b),
                FieldValue::Entity(_) | FieldValue::Reference(_) => value
                    .reference_id()
                    .map(|id| JsonValue::Number(Number::from(id)))
                    .unwrap_or(JsonValue::Null),
                _ => JsonValue::String(self.display(name)),
            };
            object.insert(name.to_string(), json);
        }
        JsonValue::Object(object)
    }

    pub(crate) fn clear_errors(&mut self) {
        self.global_errors.clear();
        self.field_errors.clear();
    }

    pub(crate) fn take_value(&mut self, field: &str) -> FieldValue {
        self.values.remove(field).unwrap_or_default()
    }

    /// Assignment without the kind check, for values produced by the engine.
    pub(crate) fn put_value(&mut self, field: &str, value: FieldValue) {
        self.unloaded.remove(field);
        self.values.insert(field.to_string(), value);
    }

    pub(crate) fn mark_unloaded(&mut self, field: &str) {
        self.unloaded.insert(field.to_string());
    }

    fn field_not_found(&self, field: &str) -> DataError {
        DataError::FieldNotFound {
            schema: self.definition.name().to_string(),
            field: field.to_string(),
        }
    }
}

fn step<'a>(value: &'a FieldValue, path: &str, segment: &str) -> Result<&'a Entity> {
    match value {
        FieldValue::Entity(entity) => Ok(entity),
        FieldValue::Null => Err(DataError::NullReference {
            path: path.to_string(),
            segment: segment.to_string(),
        }),
        other => Err(DataError::TypeMismatch(format!(
            "'{}' in '{}' is a {} value, not a reference",
            segment,
            path,
            other.kind_name()
        ))),
    }
}

impl PartialEq for Entity {
    /// Same schema, same id, same field values. Errors are not compared.
    fn eq(&self, other: &Self) -> bool {
        self.definition.name() == other.definition.name()
            && self.id == other.id
            && self.fields().eq(other.fields())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: BTreeMap<_, _> = self.values.iter().collect();
        f.debug_struct("Entity")
            .field("schema", &self.definition.name())
            .field("id", &self.id)
            .field("values", &values)
            .field("global_errors", &self.global_errors)
            .field("field_errors", &self.field_errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataDefinitionBuilder, SchemaRegistry};
    use crate::types::FieldType;
    use std::str::FromStr;

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::detached();
        registry
            .define(
                DataDefinitionBuilder::new("shop.product")
                    .field("name", FieldType::string())
                    .field("price", FieldType::decimal(2)),
            )
            .unwrap();
        registry
            .define(
                DataDefinitionBuilder::new("shop.order")
                    .field("number", FieldType::string())
                    .field("product", FieldType::eager_belongs_to("shop.product", "name"))
                    .field("supplier", FieldType::lazy_belongs_to("shop.product", "name")),
            )
            .unwrap();
        registry
    }

    fn product(registry: &SchemaRegistry) -> Entity {
        let mut product = registry.get("shop.product").unwrap().create().with_id(7);
        product.set("name", "Widget").unwrap();
        product
            .set("price", BigDecimal::from_str("9.99").unwrap())
            .unwrap();
        product
    }

    #[test]
    fn test_get_and_set_check_the_schema() {
        let registry = registry();
        let mut order = registry.get("shop.order").unwrap().create();

        assert_eq!(order.get("number").unwrap(), &FieldValue::Null);
        order.set("number", "A-1").unwrap();
        assert_eq!(order.get_str("number").unwrap(), Some("A-1"));

        assert!(matches!(order.get("missing"), Err(DataError::FieldNotFound { .. })));
        assert!(matches!(order.set("product", true), Err(DataError::TypeMismatch(_))));
        // raw id is accepted, coercion happens on save
        order.set("product", 7i64).unwrap();
    }

    #[test]
    fn test_get_path_through_loaded_references() {
        let registry = registry();
        let mut order = registry.get("shop.order").unwrap().create();
        order.set("product", product(&registry)).unwrap();

        assert_eq!(order.get_path("product.name").unwrap(), FieldValue::from("Widget"));
        assert!(matches!(
            order.get_path("product.colour"),
            Err(DataError::FieldNotFound { ref field, .. }) if field == "colour"
        ));
        assert!(matches!(
            order.get_path("supplier.name"),
            Err(DataError::NullReference { ref segment, .. }) if segment == "supplier"
        ));
        assert!(matches!(order.get_path("number.name"), Err(DataError::NullReference { .. })));
    }

    #[test]
    fn test_get_path_with_unloaded_reference() {
        let registry = registry();
        let target = registry.get("shop.product").unwrap();
        let mut order = registry.get("shop.order").unwrap().create();
        order
            .set("supplier", FieldValue::Reference(LazyEntity::new(target, 3)))
            .unwrap();

        assert_eq!(order.get_path("supplier").unwrap().reference_id(), Some(3));
        assert!(matches!(order.get_path("supplier.name"), Err(DataError::TypeMismatch(_))));
    }

    #[test]
    fn test_errors_accumulate_and_clear() {
        let registry = registry();
        let mut order = registry.get("shop.order").unwrap().create();
        order.add_field_error("number", ErrorMessage::new("a"));
        order.add_field_error("number", ErrorMessage::new("b"));
        order.add_global_error(ErrorMessage::new("c"));

        assert_eq!(order.error_count(), 3);
        assert_eq!(order.field_error("number").len(), 2);
        assert!(!order.is_valid());

        order.clear_errors();
        assert!(order.is_valid());
        assert!(order.field_error("number").is_empty());
    }

    #[test]
    fn test_to_json_renders_display_form() {
        let registry = registry();
        let mut order = registry.get("shop.order").unwrap().create().with_id(1);
        order.set("number", "A-1").unwrap();
        order.set("product", product(&registry)).unwrap();

        assert_eq!(
            order.to_json(),
            serde_json::json!({"id": 1, "number": "A-1", "product": 7, "supplier": null})
        );
        assert_eq!(product(&registry).to_json()["price"], "9.99");
    }
}
