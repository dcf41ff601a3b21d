// ============================================================================
// Data Access Engine
// ============================================================================
//
// Generic save/get/find/delete over registered schemas. Every operation runs
// in its own TransactionScope:
//
//   save:   validate -> lifecycle listeners -> lock ranking scopes ->
//           write row -> re-rank -> verify -> commit
//   delete: veto hooks -> has-many cascade -> lock scope -> delete row ->
//           compact -> verify -> commit
//
// Any fatal error drops the scope, which rolls the transaction back and
// releases its scope locks.
//
// ============================================================================

use crate::config::EngineConfig;
use crate::core::{DataError, EntityId, Result, Row, Value};
use crate::entity::{Entity, EntityList, FieldValue, LazyEntity};
use crate::hooks::{ExtensionRegistry, HookFactory};
use crate::model::{DataDefinition, DataDefinitionBuilder, SchemaRegistry};
use crate::priority::PriorityService;
use crate::search::{SearchCriteria, SearchResult};
use crate::storage::{RowPredicate, RowQuery, SortColumn, SortKey, Storage};
use crate::transaction::{TransactionId, TransactionScope};
use crate::types::{Cascade, FieldType};
use crate::validation::ValidationService;
use async_recursion::async_recursion;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub struct DataAccessService {
    storage: Arc<dyn Storage>,
    registry: SchemaRegistry,
    hooks: Arc<HookFactory>,
    validation: ValidationService,
    priority: PriorityService,
    config: EngineConfig,
}

impl DataAccessService {
    /// The service owns the schema registry, whose schemas point back at the
    /// service so that they can save themselves.
    pub fn new(storage: Arc<dyn Storage>, extensions: Arc<dyn ExtensionRegistry>, config: EngineConfig) -> Arc<Self> {
        if let Err(reason) = config.validate() {
            event!(Level::WARN, %reason, "questionable engine configuration");
        }
        let hooks = Arc::new(HookFactory::new(extensions));
        Arc::new_cyclic(|service| Self {
            registry: SchemaRegistry::new(service.clone(), hooks.clone()),
            validation: ValidationService::new(storage.clone(), config.max_string_length),
            priority: PriorityService::new(config.scope_lock_timeout, config.verify_rankings),
            storage,
            hooks,
            config,
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookFactory> {
        &self.hooks
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn priority(&self) -> &PriorityService {
        &self.priority
    }

    pub fn schema(&self, name: &str) -> Result<Arc<DataDefinition>> {
        self.registry.get(name)
    }

    /// Registers a schema and creates its table.
    pub async fn define(&self, builder: DataDefinitionBuilder) -> Result<Arc<DataDefinition>> {
        let definition = self.registry.define(builder)?;
        self.create_storage(&[definition.clone()]).await?;
        Ok(definition)
    }

    /// Registers schemas that reference each other, then creates their tables.
    pub async fn define_all(
        &self,
        builders: impl IntoIterator<Item = DataDefinitionBuilder>,
    ) -> Result<Vec<Arc<DataDefinition>>> {
        let definitions = self.registry.define_all(builders)?;
        self.create_storage(&definitions).await?;
        Ok(definitions)
    }

    async fn create_storage(&self, definitions: &[Arc<DataDefinition>]) -> Result<()> {
        for definition in definitions {
            if let Err(err) = self.create_table(definition).await {
                for registered in definitions {
                    self.registry.remove(registered.name())?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn create_table(&self, definition: &DataDefinition) -> Result<()> {
        self.storage.create_table(definition.table_schema()).await?;
        for field in definition.stored_fields().filter(|field| field.field_type().is_belongs_to()) {
            self.storage.create_index(definition.storage_id(), field.name()).await?;
        }
        event!(Level::DEBUG, schema = definition.name(), "schema table created");
        Ok(())
    }

    /// Validates and persists `entity`.
    ///
    /// Validation failures are not errors: the entity comes back with its
    /// errors attached and nothing is written. Errors are fatal conditions
    /// only, and leave storage untouched.
    pub async fn save(&self, entity: Entity) -> Result<Entity> {
        let span = info_span!(
            "data_access.save",
            schema = %entity.schema().name(),
            entity_id = ?entity.id()
        );
        self.save_entity(entity).instrument(span).await
    }

    async fn save_entity(&self, mut entity: Entity) -> Result<Entity> {
        let definition = self.registry.get(entity.schema().name())?;
        let mut txn = TransactionScope::begin(self.storage.clone()).await?;

        if let (Some(id), true) = (entity.id(), entity.is_partial()) {
            self.fill_unloaded(&txn, &definition, id, &mut entity).await?;
        }

        if !self.validation.validate(&mut entity, txn.id(), &self.registry).await? {
            event!(Level::DEBUG, errors = entity.error_count(), "entity invalid, nothing persisted");
            txn.rollback()?;
            return Ok(entity);
        }

        let existing = match entity.id() {
            Some(id) => Some(self.load_row(&txn, &definition, id).await?),
            None => None,
        };

        let hooks = definition.hooks();
        let listeners = if existing.is_some() {
            &hooks.on_update
        } else {
            &hooks.on_create
        };
        for hook in listeners.iter().chain(&hooks.on_save) {
            hook.call_with_entity(&definition, &mut entity)?;
        }
        if !self.validation.coerce_fields(&mut entity, &self.registry)? {
            event!(Level::DEBUG, errors = entity.error_count(), "listener output rejected");
            txn.rollback()?;
            return Ok(entity);
        }

        let row = to_row(&definition, &entity, existing.as_ref())?;
        let (id, row) = match entity.id() {
            Some(id) => (id, self.update_row(&mut txn, &definition, id, row).await?),
            None => self.insert_row(&mut txn, &definition, row).await?,
        };
        txn.commit().await?;

        entity.set_id(Some(id));
        for (column, field) in definition.stored_fields().enumerate() {
            if field.is_read_only() && !field.field_type().is_belongs_to() {
                entity.put_value(field.name(), field.field_type().from_storage(row[column].clone())?);
            }
        }
        event!(Level::DEBUG, entity_id = id, "entity saved");
        Ok(entity)
    }

    /// Reads the stored values of fields a projected search left out, so an
    /// update never overwrites them with nulls.
    async fn fill_unloaded(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        id: EntityId,
        entity: &mut Entity,
    ) -> Result<()> {
        let row = self.load_row(txn, definition, id).await?;
        for (value, field) in row.into_iter().zip(definition.stored_fields()) {
            if !entity.is_loaded(field.name()) {
                entity.put_value(field.name(), field.field_type().from_storage(value)?);
            }
        }
        Ok(())
    }

    async fn insert_row(
        &self,
        txn: &mut TransactionScope,
        definition: &DataDefinition,
        mut row: Row,
    ) -> Result<(EntityId, Row)> {
        let ranking = match definition.priority_field() {
            Some(priority) => {
                let scope = self.priority.scope_of(definition, &row)?;
                self.priority.lock(txn, definition, [scope]).await?;
                let column = column_of(definition, priority.name())?;
                row[column] = Value::Integer(self.priority.next_priority(txn, definition, scope).await?);
                Some(scope)
            }
            None => None,
        };

        let id = self
            .storage
            .insert(txn.id(), definition.storage_id(), row.clone())
            .await?;

        if let Some(scope) = ranking {
            self.priority.verify(txn, definition, scope).await?;
        }
        Ok((id, row))
    }

    async fn update_row(
        &self,
        txn: &mut TransactionScope,
        definition: &DataDefinition,
        id: EntityId,
        mut row: Row,
    ) -> Result<Row> {
        let mut touched = Vec::new();
        if let Some(priority) = definition.priority_field() {
            let new_scope = self.priority.scope_of(definition, &row)?;
            let current = self.lock_row_scopes(txn, definition, id, &[new_scope]).await?;
            let old_scope = self.priority.scope_of(definition, &current)?;
            let old_priority = self.priority.priority_of(definition, &current)?;
            let column = column_of(definition, priority.name())?;

            if old_scope == new_scope {
                row[column] = current[column].clone();
            } else {
                if let Some(old_priority) = old_priority {
                    self.priority.compact(txn, definition, old_scope, old_priority).await?;
                }
                row[column] = Value::Integer(self.priority.next_priority(txn, definition, new_scope).await?);
                touched.push(old_scope);
            }
            touched.push(new_scope);
        }

        if !self
            .storage
            .update(txn.id(), definition.storage_id(), id, row.clone())
            .await?
        {
            return Err(not_found(definition, id));
        }

        for scope in touched {
            self.priority.verify(txn, definition, scope).await?;
        }
        Ok(row)
    }

    /// Locks the ranking scope `id` currently belongs to, plus `also`, and
    /// returns the row as read under those locks. Retries if the row changed
    /// scope while waiting.
    async fn lock_row_scopes(
        &self,
        txn: &mut TransactionScope,
        definition: &DataDefinition,
        id: EntityId,
        also: &[Option<EntityId>],
    ) -> Result<Row> {
        loop {
            let row = self.load_row(txn, definition, id).await?;
            let scope = self.priority.scope_of(definition, &row)?;
            let scopes: Vec<Option<EntityId>> = also.iter().copied().chain([scope]).collect();
            self.priority.lock(txn, definition, scopes).await?;

            let locked = self.load_row(txn, definition, id).await?;
            if self.priority.scope_of(definition, &locked)? == scope {
                return Ok(locked);
            }
            event!(Level::DEBUG, entity_id = id, "row changed scope while locking, retrying");
        }
    }

    async fn load_row(&self, txn: &TransactionScope, definition: &DataDefinition, id: EntityId) -> Result<Row> {
        self.storage
            .get_by_id(txn.id(), definition.storage_id(), id)
            .await?
            .ok_or_else(|| not_found(definition, id))
    }

    pub async fn get(&self, schema: &str, id: EntityId) -> Result<Entity> {
        let span = info_span!("data_access.get", schema, entity_id = id);
        async {
            let definition = self.registry.get(schema)?;
            let txn = TransactionScope::begin(self.storage.clone()).await?;
            let row = self.load_row(&txn, &definition, id).await?;
            let entity = self
                .materialize(txn.id(), &definition, id, row, definition.column_fields(), true, 0)
                .await?;
            txn.commit().await?;
            Ok(entity)
        }
        .instrument(span)
        .await
    }

    pub async fn find(&self, schema: &str, criteria: SearchCriteria) -> Result<SearchResult> {
        let span = info_span!("data_access.find", schema);
        async {
            let definition = self.registry.get(schema)?;
            let (query, fields) = criteria.to_row_query(&definition, &self.registry)?;
            let full = criteria.projected_fields().is_none();

            let txn = TransactionScope::begin(self.storage.clone()).await?;
            let rows = self.storage.query(txn.id(), definition.storage_id(), &query).await?;
            let mut entities = Vec::with_capacity(rows.rows.len());
            for (id, row) in rows.rows {
                entities.push(self.materialize(txn.id(), &definition, id, row, &fields, full, 0).await?);
            }
            txn.commit().await?;

            event!(Level::DEBUG, found = entities.len(), total = rows.total, "search finished");
            Ok(SearchResult {
                entities,
                total_entities: rows.total,
            })
        }
        .instrument(span)
        .await
    }

    /// Builds an entity from a stored row. `fields` maps row positions to
    /// schema fields; has-many values are attached only for `full` rows.
    #[async_recursion]
    async fn materialize(
        &self,
        txn: TransactionId,
        definition: &Arc<DataDefinition>,
        id: EntityId,
        row: Row,
        fields: &[usize],
        full: bool,
        depth: usize,
    ) -> Result<Entity> {
        let mut entity = Entity::new(definition.clone()).with_id(id);

        for (value, field_index) in row.into_iter().zip(fields) {
            let field = &definition.fields()[*field_index];
            let materialized = match (field.field_type(), value) {
                (_, Value::Null) => FieldValue::Null,
                (FieldType::BelongsTo { target, eager, .. }, Value::Integer(target_id)) => {
                    let target = self.registry.get(target)?;
                    let loaded = if *eager && depth < self.config.max_eager_depth {
                        self.storage.get_by_id(txn, target.storage_id(), target_id).await?
                    } else {
                        None
                    };
                    match loaded {
                        Some(target_row) => {
                            let target_entity = self
                                .materialize(txn, &target, target_id, target_row, target.column_fields(), true, depth + 1)
                                .await?;
                            FieldValue::Entity(Box::new(target_entity))
                        }
                        None => FieldValue::Reference(LazyEntity::new(target, target_id)),
                    }
                }
                (field_type, value) => field_type.from_storage(value)?,
            };
            entity.put_value(field.name(), materialized);
        }
        for field_index in definition.column_fields() {
            if !fields.contains(field_index) {
                entity.mark_unloaded(definition.fields()[*field_index].name());
            }
        }

        if full {
            for field in definition.fields() {
                if let FieldType::HasMany { target, join_field, .. } = field.field_type() {
                    let list = EntityList::new(self.registry.get(target)?, join_field.clone(), Some(id));
                    entity.put_value(field.name(), FieldValue::Entities(list));
                }
            }
        }

        for hook in &definition.hooks().on_view {
            hook.call_with_entity(definition, &mut entity)?;
        }
        Ok(entity)
    }

    /// Deletes one entity, its cascaded children, and compacts its ranking.
    /// Returns `false`, with nothing changed, if an on-delete hook vetoed.
    pub async fn delete(&self, schema: &str, id: EntityId) -> Result<bool> {
        let span = info_span!("data_access.delete", schema, entity_id = id);
        async {
            let definition = self.registry.get(schema)?;
            let mut txn = TransactionScope::begin(self.storage.clone()).await?;
            let mut deleting = HashSet::new();
            if !self.delete_in(&mut txn, &definition, id, &mut deleting).await? {
                event!(Level::DEBUG, "delete vetoed");
                txn.rollback()?;
                return Ok(false);
            }
            txn.commit().await?;
            event!(Level::DEBUG, "entity deleted");
            Ok(true)
        }
        .instrument(span)
        .await
    }

    /// `deleting` holds the rows already being deleted higher up the
    /// cascade; cyclic references stop there.
    #[async_recursion]
    async fn delete_in(
        &self,
        txn: &mut TransactionScope,
        definition: &Arc<DataDefinition>,
        id: EntityId,
        deleting: &mut HashSet<(String, EntityId)>,
    ) -> Result<bool> {
        deleting.insert((definition.name().to_string(), id));
        let row = self.load_row(txn, definition, id).await?;

        if !definition.hooks().on_delete.is_empty() {
            let entity = self
                .materialize(txn.id(), definition, id, row, definition.column_fields(), true, 0)
                .await?;
            for hook in &definition.hooks().on_delete {
                if !hook.call_with_entity_and_get_boolean(definition, &entity)? {
                    return Ok(false);
                }
            }
        }

        for field in definition.fields() {
            let FieldType::HasMany {
                target,
                join_field,
                cascade,
            } = field.field_type()
            else {
                continue;
            };
            let target = self.registry.get(target)?;
            let join_column = column_of(&target, join_field)?;
            let children_query = RowQuery::default()
                .filter(RowPredicate::Eq(join_column, Value::Integer(id)))
                .sort(SortKey::new(SortColumn::Id, false))
                .project(vec![]);
            let children = self.storage.query(txn.id(), target.storage_id(), &children_query).await?;

            for (child_id, _) in children.rows {
                if deleting.contains(&(target.name().to_string(), child_id)) {
                    continue;
                }
                match cascade {
                    Cascade::Delete => {
                        if !self.delete_in(txn, &target, child_id, deleting).await? {
                            return Ok(false);
                        }
                    }
                    Cascade::Nullify => self.detach(txn, &target, child_id, join_column).await?,
                }
            }
        }

        let ranked = definition.priority_field().is_some();
        let row = if ranked {
            self.lock_row_scopes(txn, definition, id, &[]).await?
        } else {
            self.load_row(txn, definition, id).await?
        };

        if !self.storage.delete(txn.id(), definition.storage_id(), id).await? {
            return Err(not_found(definition, id));
        }

        if ranked {
            let scope = self.priority.scope_of(definition, &row)?;
            if let Some(priority) = self.priority.priority_of(definition, &row)? {
                self.priority.compact(txn, definition, scope, priority).await?;
            }
            self.priority.verify(txn, definition, scope).await?;
        }
        Ok(true)
    }

    /// Clears a child's back-reference to a deleted parent. A child ranked
    /// on that reference moves to the end of the unscoped ranking.
    async fn detach(
        &self,
        txn: &mut TransactionScope,
        definition: &DataDefinition,
        id: EntityId,
        join_column: usize,
    ) -> Result<()> {
        let ranked_on_join = definition
            .scope_field()
            .and_then(|scope| definition.column_index(scope.name()))
            == Some(join_column);

        if !ranked_on_join {
            let mut row = self.load_row(txn, definition, id).await?;
            row[join_column] = Value::Null;
            self.storage.update(txn.id(), definition.storage_id(), id, row).await?;
            return Ok(());
        }

        let mut row = self.lock_row_scopes(txn, definition, id, &[None]).await?;
        let old_scope = self.priority.scope_of(definition, &row)?;
        if let Some(priority) = self.priority.priority_of(definition, &row)? {
            self.priority.compact(txn, definition, old_scope, priority).await?;
        }
        if let Some(priority) = definition.priority_field() {
            let column = column_of(definition, priority.name())?;
            row[column] = Value::Integer(self.priority.next_priority(txn, definition, None).await?);
        }
        row[join_column] = Value::Null;
        self.storage.update(txn.id(), definition.storage_id(), id, row).await?;

        self.priority.verify(txn, definition, old_scope).await?;
        self.priority.verify(txn, definition, None).await
    }

    /// Moves a ranked entity to `position` in its scope (clamped to `1..=N`).
    pub async fn move_to(&self, schema: &str, id: EntityId, position: i64) -> Result<i64> {
        let span = info_span!("data_access.move_to", schema, entity_id = id, position);
        self.reposition(schema, id, |_| position).instrument(span).await
    }

    /// Moves a ranked entity by `offset` places; negative moves up.
    pub async fn move_by(&self, schema: &str, id: EntityId, offset: i64) -> Result<i64> {
        let span = info_span!("data_access.move_by", schema, entity_id = id, offset);
        self.reposition(schema, id, |current| current.saturating_add(offset))
            .instrument(span)
            .await
    }

    async fn reposition(
        &self,
        schema: &str,
        id: EntityId,
        target: impl FnOnce(i64) -> i64 + Send,
    ) -> Result<i64> {
        let definition = self.registry.get(schema)?;
        let mut txn = TransactionScope::begin(self.storage.clone()).await?;
        let row = self.lock_row_scopes(&mut txn, &definition, id, &[]).await?;
        let scope = self.priority.scope_of(&definition, &row)?;
        let current = self.priority.priority_of(&definition, &row)?.unwrap_or(0);

        let position = self.priority.move_to(&txn, &definition, id, target(current)).await?;
        self.priority.verify(&txn, &definition, scope).await?;
        txn.commit().await?;
        event!(Level::DEBUG, from = current, to = position, "entity moved");
        Ok(position)
    }
}

/// Storage row for `entity`. Read-only fields keep their stored values on
/// update.
fn to_row(definition: &DataDefinition, entity: &Entity, existing: Option<&Row>) -> Result<Row> {
    definition
        .stored_fields()
        .enumerate()
        .map(|(column, field)| match existing {
            Some(existing) if field.is_read_only() => Ok(existing[column].clone()),
            _ => field.field_type().to_storage(entity.get(field.name())?),
        })
        .collect()
}

fn column_of(definition: &DataDefinition, field: &str) -> Result<usize> {
    definition.column_index(field).ok_or_else(|| DataError::FieldNotFound {
        schema: definition.name().to_string(),
        field: field.to_string(),
    })
}

fn not_found(definition: &DataDefinition, id: EntityId) -> DataError {
    DataError::EntityNotFound {
        schema: definition.name().to_string(),
        id,
    }
}
