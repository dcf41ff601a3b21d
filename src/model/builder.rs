use super::{DataDefinition, FieldDefinition, LifecycleHooks};
use crate::core::{Result, SchemaError};
use crate::data_access::DataAccessService;
use crate::hooks::{ExtensionId, HookFactory};
use crate::types::FieldType;
use crate::validation::{CustomEntityValidator, EntityValidator};
use std::collections::HashSet;
use std::sync::{Arc, Weak};

enum PendingValidator {
    Ready(Arc<dyn EntityValidator>),
    Hook {
        id: ExtensionId,
        error_message: Option<String>,
    },
}

#[derive(Clone, Copy)]
enum LifecycleEvent {
    Create,
    Update,
    Save,
    View,
    Delete,
}

/// Mutable draft of a schema. Registration consumes it.
pub struct DataDefinitionBuilder {
    name: String,
    fields: Vec<FieldDefinition>,
    validators: Vec<PendingValidator>,
    hooks: Vec<(LifecycleEvent, ExtensionId)>,
}

impl DataDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            validators: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.with_field(FieldDefinition::new(name, field_type))
    }

    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn validator(mut self, validator: impl EntityValidator + 'static) -> Self {
        self.validators.push(PendingValidator::Ready(Arc::new(validator)));
        self
    }

    /// Entity validator backed by a predicate hook, with the default message key.
    pub fn validate_with(mut self, component: &str, method: &str) -> Self {
        self.validators.push(PendingValidator::Hook {
            id: ExtensionId::new(component, method),
            error_message: None,
        });
        self
    }

    pub fn validate_with_message(mut self, component: &str, method: &str, key: impl Into<String>) -> Self {
        self.validators.push(PendingValidator::Hook {
            id: ExtensionId::new(component, method),
            error_message: Some(key.into()),
        });
        self
    }

    pub fn on_create(self, component: &str, method: &str) -> Self {
        self.hook(LifecycleEvent::Create, component, method)
    }

    pub fn on_update(self, component: &str, method: &str) -> Self {
        self.hook(LifecycleEvent::Update, component, method)
    }

    pub fn on_save(self, component: &str, method: &str) -> Self {
        self.hook(LifecycleEvent::Save, component, method)
    }

    pub fn on_view(self, component: &str, method: &str) -> Self {
        self.hook(LifecycleEvent::View, component, method)
    }

    /// Predicate hook; returning `false` vetoes the delete.
    pub fn on_delete(self, component: &str, method: &str) -> Self {
        self.hook(LifecycleEvent::Delete, component, method)
    }

    fn hook(mut self, event: LifecycleEvent, component: &str, method: &str) -> Self {
        self.hooks.push((event, ExtensionId::new(component, method)));
        self
    }

    /// Checks the draft and resolves its hooks. Relation targets are checked
    /// by the registry, which sees the other schemas.
    pub(crate) fn build(self, hook_factory: &HookFactory, data_access: Weak<DataAccessService>) -> Result<DataDefinition> {
        check_schema_name(&self.name)?;

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_identifier(field.name()) || field.name() == "id" {
                return Err(SchemaError::InvalidName(format!("{}.{}", self.name, field.name())).into());
            }
            if !seen.insert(field.name()) {
                return Err(SchemaError::DuplicateFieldName {
                    schema: self.name.clone(),
                    field: field.name().to_string(),
                }
                .into());
            }
        }

        let mut priority_fields = self
            .fields
            .iter()
            .filter(|field| matches!(field.field_type(), FieldType::Priority { .. }));
        if let Some(priority) = priority_fields.next() {
            if priority_fields.next().is_some() {
                return Err(SchemaError::MultiplePriorityFields(self.name.clone()).into());
            }
            if let FieldType::Priority { scope_field } = priority.field_type() {
                let scoped_on_belongs_to = self
                    .fields
                    .iter()
                    .any(|field| field.name() == scope_field && field.field_type().is_belongs_to());
                if !scoped_on_belongs_to {
                    return Err(SchemaError::InvalidPriorityScope {
                        schema: self.name.clone(),
                        field: priority.name().to_string(),
                        scope: scope_field.clone(),
                    }
                    .into());
                }
            }
        }

        let mut entity_validators: Vec<Arc<dyn EntityValidator>> = Vec::with_capacity(self.validators.len());
        for pending in self.validators {
            let validator: Arc<dyn EntityValidator> = match pending {
                PendingValidator::Ready(validator) => validator,
                PendingValidator::Hook { id, error_message } => {
                    let hook = hook_factory.entity_predicate(&id.component, &id.method)?;
                    let validator = CustomEntityValidator::new(hook);
                    Arc::new(match error_message {
                        Some(key) => validator.custom_error_message(key),
                        None => validator,
                    })
                }
            };
            entity_validators.push(validator);
        }

        let mut hooks = LifecycleHooks::default();
        for (event, id) in self.hooks {
            let (component, method) = (id.component.as_str(), id.method.as_str());
            match event {
                LifecycleEvent::Create => hooks.on_create.push(hook_factory.entity_listener(component, method)?),
                LifecycleEvent::Update => hooks.on_update.push(hook_factory.entity_listener(component, method)?),
                LifecycleEvent::Save => hooks.on_save.push(hook_factory.entity_listener(component, method)?),
                LifecycleEvent::View => hooks.on_view.push(hook_factory.entity_listener(component, method)?),
                LifecycleEvent::Delete => hooks.on_delete.push(hook_factory.entity_predicate(component, method)?),
            }
        }

        Ok(DataDefinition::new(
            self.name,
            self.fields,
            entity_validators,
            hooks,
            data_access,
        ))
    }
}

fn check_schema_name(name: &str) -> std::result::Result<(), SchemaError> {
    match name.split_once('.') {
        Some((namespace, entity)) if is_identifier(namespace) && is_identifier(entity) => Ok(()),
        _ => Err(SchemaError::InvalidName(name.to_string())),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataError, ResolutionError};
    use crate::hooks::{Extension, InMemoryExtensions};

    fn factory() -> HookFactory {
        let extensions = InMemoryExtensions::new();
        extensions
            .register("orderHooks", "check", Extension::entity_predicate(|_, _| Ok(true)))
            .unwrap();
        extensions
            .register("orderHooks", "stamp", Extension::entity_listener(|_, _| Ok(())))
            .unwrap();
        HookFactory::new(Arc::new(extensions))
    }

    fn build(builder: DataDefinitionBuilder) -> Result<DataDefinition> {
        builder.build(&factory(), Weak::new())
    }

    fn schema_error(result: Result<DataDefinition>) -> SchemaError {
        match result {
            Err(DataError::Schema(err)) => err,
            other => panic!("expected schema error, got {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = schema_error(build(
            DataDefinitionBuilder::new("orders.order")
                .field("number", FieldType::string())
                .field("number", FieldType::integer()),
        ));
        assert_eq!(
            err,
            SchemaError::DuplicateFieldName {
                schema: "orders.order".into(),
                field: "number".into()
            }
        );
    }

    #[test]
    fn test_names_checked() {
        assert!(matches!(
            schema_error(build(DataDefinitionBuilder::new("orders"))),
            SchemaError::InvalidName(_)
        ));
        assert!(matches!(
            schema_error(build(DataDefinitionBuilder::new("orders.order").field("id", FieldType::integer()))),
            SchemaError::InvalidName(_)
        ));
        assert!(matches!(
            schema_error(build(DataDefinitionBuilder::new("orders.order").field("a.b", FieldType::integer()))),
            SchemaError::InvalidName(_)
        ));
    }

    #[test]
    fn test_priority_scope_must_be_belongs_to() {
        let err = schema_error(build(
            DataDefinitionBuilder::new("orders.line")
                .field("order", FieldType::integer())
                .field("position", FieldType::priority("order")),
        ));
        assert!(matches!(err, SchemaError::InvalidPriorityScope { ref scope, .. } if scope == "order"));

        let err = schema_error(build(
            DataDefinitionBuilder::new("orders.line")
                .field("order", FieldType::lazy_belongs_to("orders.order", "number"))
                .field("position", FieldType::priority("order"))
                .field("rank", FieldType::priority("order")),
        ));
        assert_eq!(err, SchemaError::MultiplePriorityFields("orders.line".into()));
    }

    #[test]
    fn test_hooks_resolved_with_contract() {
        let definition = build(
            DataDefinitionBuilder::new("orders.order")
                .field("number", FieldType::string())
                .validate_with("orderHooks", "check")
                .on_save("orderHooks", "stamp")
                .on_delete("orderHooks", "check"),
        )
        .unwrap();
        assert_eq!(definition.entity_validators().len(), 1);
        assert_eq!(definition.hooks().on_save.len(), 1);
        assert_eq!(definition.hooks().on_delete.len(), 1);

        let wrong_shape = build(DataDefinitionBuilder::new("orders.order").on_save("orderHooks", "check"));
        assert!(matches!(
            wrong_shape,
            Err(DataError::Resolution(ResolutionError::ContractMismatch { .. }))
        ));

        let missing = build(DataDefinitionBuilder::new("orders.order").validate_with("orderHooks", "nope"));
        assert!(matches!(
            missing,
            Err(DataError::Resolution(ResolutionError::UnresolvedHook(_)))
        ));
    }
}
