//! Schema model: immutable descriptions of entity shapes.
//!
//! Schemas are drafted with a [`DataDefinitionBuilder`] and frozen when the
//! [`SchemaRegistry`] accepts them. A registered [`DataDefinition`] has no
//! mutators at all; the builder is consumed by registration.

pub mod builder;
pub mod registry;

pub use builder::DataDefinitionBuilder;
pub use registry::SchemaRegistry;

use crate::core::{Column, DataError, EntityId, Result};
use crate::data_access::DataAccessService;
use crate::entity::{Entity, FieldValue};
use crate::hooks::HookDefinition;
use crate::search::{SearchCriteria, SearchResult};
use crate::storage::TableSchema;
use crate::types::FieldType;
use crate::validation::{EntityValidator, FieldValidator};
use bigdecimal::BigDecimal;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

/// One named, typed slot of a schema.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    name: String,
    field_type: FieldType,
    read_only: bool,
    default_value: Option<FieldValue>,
    validators: Vec<FieldValidator>,
}

impl FieldDefinition {
    /// Priority fields start read-only; everything else starts writable.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let read_only = matches!(field_type, FieldType::Priority { .. });
        Self {
            name: name.into(),
            field_type,
            read_only,
            default_value: None,
            validators: Vec::new(),
        }
    }

    pub fn required(self) -> Self {
        self.validator(FieldValidator::required())
    }

    pub fn unique(self) -> Self {
        self.validator(FieldValidator::unique())
    }

    pub fn validator(mut self, validator: FieldValidator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn default(&self) -> Option<&FieldValue> {
        self.default_value.as_ref()
    }

    pub fn validators(&self) -> &[FieldValidator] {
        &self.validators
    }

    pub fn is_required(&self) -> bool {
        self.validators.iter().any(FieldValidator::is_required)
    }
}

/// Listener and veto hooks attached to a schema.
#[derive(Debug, Clone, Default)]
pub struct LifecycleHooks {
    pub on_create: Vec<HookDefinition>,
    pub on_update: Vec<HookDefinition>,
    pub on_save: Vec<HookDefinition>,
    pub on_view: Vec<HookDefinition>,
    pub on_delete: Vec<HookDefinition>,
}

/// Registered schema.
pub struct DataDefinition {
    name: String,
    storage_id: String,
    fields: Vec<FieldDefinition>,
    /// Field index of each storage column, in column order.
    columns: Vec<usize>,
    column_index: HashMap<String, usize>,
    entity_validators: Vec<Arc<dyn EntityValidator>>,
    hooks: LifecycleHooks,
    data_access: Weak<DataAccessService>,
}

impl DataDefinition {
    pub(crate) fn new(
        name: String,
        fields: Vec<FieldDefinition>,
        entity_validators: Vec<Arc<dyn EntityValidator>>,
        hooks: LifecycleHooks,
        data_access: Weak<DataAccessService>,
    ) -> Self {
        let columns: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, field)| field.field_type().data_type().is_some())
            .map(|(idx, _)| idx)
            .collect();
        let column_index = columns
            .iter()
            .enumerate()
            .map(|(column, field)| (fields[*field].name().to_string(), column))
            .collect();

        Self {
            storage_id: name.replace('.', "_"),
            name,
            fields,
            columns,
            column_index,
            entity_validators,
            hooks,
            data_access,
        }
    }

    /// Qualified name, `<namespace>.<entity>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        self.name.split_once('.').map(|(namespace, _)| namespace).unwrap_or_default()
    }

    pub fn entity_name(&self) -> &str {
        self.name.split_once('.').map(|(_, entity)| entity).unwrap_or(&self.name)
    }

    /// Storage table backing this schema.
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|field| field.name() == name)
    }

    pub fn get_field(&self, name: &str) -> Result<&FieldDefinition> {
        self.field(name).ok_or_else(|| DataError::FieldNotFound {
            schema: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Storage column of a field; `None` for has-many fields.
    pub fn column_index(&self, field: &str) -> Option<usize> {
        self.column_index.get(field).copied()
    }

    /// Field index of each storage column.
    pub fn column_fields(&self) -> &[usize] {
        &self.columns
    }

    /// Fields backed by a storage column, in column order.
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.columns.iter().map(|idx| &self.fields[*idx])
    }

    pub fn priority_field(&self) -> Option<&FieldDefinition> {
        self.fields
            .iter()
            .find(|field| matches!(field.field_type(), FieldType::Priority { .. }))
    }

    /// Belongs-to field partitioning the priority ranking.
    pub fn scope_field(&self) -> Option<&FieldDefinition> {
        match self.priority_field()?.field_type() {
            FieldType::Priority { scope_field } => self.field(scope_field),
            _ => None,
        }
    }

    pub fn entity_validators(&self) -> &[Arc<dyn EntityValidator>] {
        &self.entity_validators
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub fn table_schema(&self) -> TableSchema {
        let columns = self
            .stored_fields()
            .filter_map(|field| {
                let data_type = field.field_type().data_type()?;
                Some(Column::new(field.name(), data_type))
            })
            .collect();
        TableSchema::new(self.storage_id.clone(), columns)
    }

    /// New unsaved entity with field defaults applied.
    pub fn create(self: &Arc<Self>) -> Entity {
        let mut entity = Entity::new(self.clone());
        for field in &self.fields {
            if let Some(default) = field.default() {
                entity.put_value(field.name(), default.clone());
            }
        }
        entity
    }

    /// Unsaved entity from external JSON input. Values are raw and get
    /// coerced on save; read-only fields in the input are ignored.
    pub fn entity_from_json(self: &Arc<Self>, json: &JsonValue) -> Result<Entity> {
        let JsonValue::Object(object) = json else {
            return Err(DataError::TypeMismatch(format!(
                "entity of '{}' must be a JSON object",
                self.name
            )));
        };

        let mut entity = self.create();
        for (key, value) in object {
            if key == "id" {
                entity.set_id(value.as_i64());
                continue;
            }
            if self.get_field(key)?.is_read_only() {
                continue;
            }
            entity.set(key, json_to_field_value(key, value)?)?;
        }
        Ok(entity)
    }

    pub fn data_access(&self) -> Result<Arc<DataAccessService>> {
        self.data_access
            .upgrade()
            .ok_or_else(|| DataError::Persistence("data access service is gone".to_string()))
    }

    pub async fn save(&self, entity: Entity) -> Result<Entity> {
        self.data_access()?.save(entity).await
    }

    pub async fn get(&self, id: EntityId) -> Result<Entity> {
        self.data_access()?.get(&self.name, id).await
    }

    pub async fn find(&self, criteria: SearchCriteria) -> Result<SearchResult> {
        self.data_access()?.find(&self.name, criteria).await
    }

    pub async fn delete(&self, id: EntityId) -> Result<bool> {
        self.data_access()?.delete(&self.name, id).await
    }
}

fn json_to_field_value(field: &str, value: &JsonValue) -> Result<FieldValue> {
    Ok(match value {
        JsonValue::Null => FieldValue::Null,
        JsonValue::Bool(b) => FieldValue::Boolean(*b),
        JsonValue::String(s) => FieldValue::Text(s.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => BigDecimal::from_str(&n.to_string())
                .map(FieldValue::Decimal)
                .map_err(|err| DataError::TypeMismatch(format!("field '{}': {}", field, err)))?,
        },
        // a reference given as {"id": n}
        JsonValue::Object(object) => match object.get("id").and_then(JsonValue::as_i64) {
            Some(id) => FieldValue::Integer(id),
            None => {
                return Err(DataError::TypeMismatch(format!(
                    "field '{}': object values need an integer id",
                    field
                )));
            }
        },
        JsonValue::Array(_) => {
            return Err(DataError::TypeMismatch(format!(
                "field '{}': arrays are not supported",
                field
            )));
        }
    })
}

impl fmt::Debug for DataDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDefinition")
            .field("name", &self.name)
            .field("storage_id", &self.storage_id)
            .field("fields", &self.fields)
            .field("entity_validators", &self.entity_validators.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}
