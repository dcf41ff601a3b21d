use super::{ErrorMessage, FieldValidator};
use crate::core::Result;
use crate::entity::{Entity, FieldValue};
use crate::model::{DataDefinition, FieldDefinition, SchemaRegistry};
use crate::storage::{RowPredicate, RowQuery, Storage};
use crate::transaction::TransactionId;
use crate::types::BELONGS_TO_NOT_FOUND;
use std::sync::Arc;

/// Runs coercion, field validators and entity validators against an entity.
///
/// Pass order:
/// 1. previous errors are dropped (re-validation replaces, never appends);
/// 2. every field, in declaration order, is coerced; a coercion failure is
///    recorded and that field's validators are skipped;
/// 3. every validator of every coerced field runs, failures accumulate;
/// 4. entity validators run in registration order, regardless of step 3.
///
/// The entity is valid iff no field error was recorded and every entity
/// validator returned `true` without attaching a global error.
pub struct ValidationService {
    storage: Arc<dyn Storage>,
    max_string_length: usize,
}

impl ValidationService {
    pub fn new(storage: Arc<dyn Storage>, max_string_length: usize) -> Self {
        Self {
            storage,
            max_string_length,
        }
    }

    pub async fn validate(&self, entity: &mut Entity, txn: TransactionId, registry: &SchemaRegistry) -> Result<bool> {
        entity.clear_errors();
        let definition = entity.schema().clone();

        for field in definition.fields() {
            let Some(value) = self.coerce_field(entity, field, registry)? else {
                continue;
            };

            if let Some(error) = field.field_type().validate(&value, self.max_string_length) {
                entity.add_field_error(field.name(), error);
            }

            if let Some(error) = self.check_reference(field, &value, txn, registry).await? {
                entity.add_field_error(field.name(), error);
            }

            for validator in field.validators() {
                let failure = if validator.is_unique() {
                    self.check_unique(&definition, field, validator, &value, entity, txn).await?
                } else {
                    validator.validate(field, &value)?
                };
                if let Some(error) = failure {
                    entity.add_field_error(field.name(), error);
                }
            }
        }

        let mut entity_valid = true;
        for validator in definition.entity_validators() {
            entity_valid &= validator.validate(&definition, entity)?;
        }

        Ok(entity_valid && !entity.has_errors())
    }

    /// Coerces every field without running validators. Used after lifecycle
    /// listeners, which may assign raw values.
    pub fn coerce_fields(&self, entity: &mut Entity, registry: &SchemaRegistry) -> Result<bool> {
        let definition = entity.schema().clone();
        let mut all_coerced = true;
        for field in definition.fields() {
            all_coerced &= self.coerce_field(entity, field, registry)?.is_some();
        }
        Ok(all_coerced)
    }

    fn coerce_field(
        &self,
        entity: &mut Entity,
        field: &FieldDefinition,
        registry: &SchemaRegistry,
    ) -> Result<Option<FieldValue>> {
        let raw = entity.take_value(field.name());
        match field.field_type().coerce(raw.clone(), registry)? {
            Ok(value) => {
                entity.put_value(field.name(), value.clone());
                Ok(Some(value))
            }
            Err(error) => {
                entity.put_value(field.name(), raw);
                entity.add_field_error(field.name(), error);
                Ok(None)
            }
        }
    }

    async fn check_reference(
        &self,
        field: &FieldDefinition,
        value: &FieldValue,
        txn: TransactionId,
        registry: &SchemaRegistry,
    ) -> Result<Option<ErrorMessage>> {
        let (Some(target), Some(id)) = (field.field_type().target(), value.reference_id()) else {
            return Ok(None);
        };
        if !field.field_type().is_belongs_to() {
            return Ok(None);
        }

        let target = registry.get(target)?;
        let exists = self.storage.get_by_id(txn, target.storage_id(), id).await?.is_some();
        Ok((!exists).then(|| ErrorMessage::with_args(BELONGS_TO_NOT_FOUND, [id.to_string()])))
    }

    async fn check_unique(
        &self,
        definition: &DataDefinition,
        field: &FieldDefinition,
        validator: &FieldValidator,
        value: &FieldValue,
        entity: &Entity,
        txn: TransactionId,
    ) -> Result<Option<ErrorMessage>> {
        let Some(column) = definition.column_index(field.name()) else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }

        let mut query = RowQuery::default()
            .filter(RowPredicate::Eq(column, field.field_type().to_storage(value)?))
            .limit(1);
        if let Some(id) = entity.id() {
            query = query.filter(RowPredicate::Not(Box::new(RowPredicate::IdEq(id))));
        }

        let matches = self.storage.query(txn, definition.storage_id(), &query).await?;
        Ok((matches.total > 0).then(|| validator.unique_violation()))
    }
}
