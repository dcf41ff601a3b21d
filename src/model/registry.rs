use super::{DataDefinition, DataDefinitionBuilder};
use crate::core::{DataError, Result, SchemaError};
use crate::data_access::DataAccessService;
use crate::hooks::{HookFactory, InMemoryExtensions};
use crate::types::FieldType;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// Registered schemas by qualified name.
///
/// Relation targets are looked up by name at use time, so schemas that
/// reference each other are registered together with [`SchemaRegistry::define_all`].
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<DataDefinition>>>,
    hooks: Arc<HookFactory>,
    data_access: Weak<DataAccessService>,
}

impl SchemaRegistry {
    pub fn new(data_access: Weak<DataAccessService>, hooks: Arc<HookFactory>) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            hooks,
            data_access,
        }
    }

    /// Registry with no hooks and no data access service. Its schemas can
    /// build and check entities but not persist them.
    pub fn detached() -> Self {
        Self::new(Weak::new(), Arc::new(HookFactory::new(Arc::new(InMemoryExtensions::new()))))
    }

    pub fn hooks(&self) -> &Arc<HookFactory> {
        &self.hooks
    }

    /// Registers one schema. Its relations may only point at itself or at
    /// schemas already registered.
    pub fn define(&self, builder: DataDefinitionBuilder) -> Result<Arc<DataDefinition>> {
        let mut defined = self.define_all(vec![builder])?;
        defined
            .pop()
            .ok_or_else(|| DataError::Persistence("schema registration produced nothing".to_string()))
    }

    /// Registers a batch atomically: either every schema is registered and
    /// every relation resolves, or nothing is registered.
    pub fn define_all(
        &self,
        builders: impl IntoIterator<Item = DataDefinitionBuilder>,
    ) -> Result<Vec<Arc<DataDefinition>>> {
        let mut batch = Vec::new();
        for builder in builders {
            batch.push(Arc::new(builder.build(&self.hooks, self.data_access.clone())?));
        }

        let mut schemas = self.schemas.write()?;
        let mut names = Vec::with_capacity(batch.len());
        for definition in &batch {
            let name = definition.name().to_string();
            if schemas.contains_key(&name) || names.contains(&name) {
                return Err(SchemaError::DuplicateSchema(name).into());
            }
            names.push(name);
        }

        let resolved = batch.iter().try_for_each(|definition| {
            check_references(definition, |target| {
                schemas
                    .get(target)
                    .or_else(|| batch.iter().find(|candidate| candidate.name() == target))
                    .cloned()
            })
        });
        resolved?;

        for definition in &batch {
            schemas.insert(definition.name().to_string(), definition.clone());
        }
        Ok(batch)
    }

    pub fn get(&self, name: &str) -> Result<Arc<DataDefinition>> {
        self.schemas
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::SchemaNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas
            .read()
            .map(|schemas| schemas.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schemas
            .read()
            .map(|schemas| schemas.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        self.schemas.write()?.remove(name);
        Ok(())
    }
}

fn check_references(
    definition: &DataDefinition,
    lookup: impl Fn(&str) -> Option<Arc<DataDefinition>>,
) -> std::result::Result<(), SchemaError> {
    for field in definition.fields() {
        let unresolved = |target: String| SchemaError::UnresolvedFieldType {
            schema: definition.name().to_string(),
            field: field.name().to_string(),
            target,
        };

        match field.field_type() {
            FieldType::BelongsTo {
                target,
                display_field,
                ..
            } => {
                let target_definition = lookup(target).ok_or_else(|| unresolved(target.clone()))?;
                if target_definition.field(display_field).is_none() {
                    return Err(unresolved(format!("{}.{}", target, display_field)));
                }
            }
            FieldType::HasMany { target, join_field, .. } => {
                let target_definition = lookup(target).ok_or_else(|| unresolved(target.clone()))?;
                let joins_back = target_definition.field(join_field).is_some_and(|join| {
                    matches!(join.field_type(), FieldType::BelongsTo { target, .. } if target == definition.name())
                });
                if !joins_back {
                    return Err(unresolved(format!("{}.{}", target, join_field)));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> DataDefinitionBuilder {
        DataDefinitionBuilder::new("family.parent")
            .field("name", FieldType::string())
            .field("children", FieldType::has_many("family.child", "parent"))
    }

    fn child() -> DataDefinitionBuilder {
        DataDefinitionBuilder::new("family.child")
            .field("name", FieldType::string())
            .field("parent", FieldType::lazy_belongs_to("family.parent", "name"))
    }

    #[test]
    fn test_circular_schemas_register_together() {
        let registry = SchemaRegistry::detached();
        let defined = registry.define_all(vec![parent(), child()]).unwrap();
        assert_eq!(defined.len(), 2);
        assert_eq!(registry.names(), vec!["family.child".to_string(), "family.parent".to_string()]);
    }

    #[test]
    fn test_unresolved_target_registers_nothing() {
        let registry = SchemaRegistry::detached();
        let err = registry.define(parent()).unwrap_err();
        assert!(matches!(
            err,
            DataError::Schema(SchemaError::UnresolvedFieldType { ref target, .. }) if target == "family.child"
        ));
        assert!(!registry.contains("family.parent"));
    }

    #[test]
    fn test_has_many_must_join_back() {
        let registry = SchemaRegistry::detached();
        let orphan = DataDefinitionBuilder::new("family.child").field("name", FieldType::string());
        let err = registry.define_all(vec![parent(), orphan]).unwrap_err();
        assert!(matches!(
            err,
            DataError::Schema(SchemaError::UnresolvedFieldType { ref target, .. }) if target == "family.child.parent"
        ));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_duplicates_and_lookup() {
        let registry = SchemaRegistry::detached();
        registry.define_all(vec![parent(), child()]).unwrap();
        assert!(matches!(
            registry.define(child()),
            Err(DataError::Schema(SchemaError::DuplicateSchema(_)))
        ));
        assert!(matches!(registry.get("family.pet"), Err(DataError::SchemaNotFound(_))));

        let child = registry.get("family.child").unwrap();
        assert_eq!(child.name(), "family.child");
        registry.remove("family.child").unwrap();
        assert!(!registry.contains("family.child"));
    }

    #[test]
    fn test_self_reference() {
        let registry = SchemaRegistry::detached();
        registry
            .define(
                DataDefinitionBuilder::new("org.unit")
                    .field("name", FieldType::string())
                    .field("parent", FieldType::lazy_belongs_to("org.unit", "name")),
            )
            .unwrap();
        assert!(registry.contains("org.unit"));
    }
}
