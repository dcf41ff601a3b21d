use super::ErrorMessage;
use crate::core::Result;
use crate::entity::Entity;
use crate::hooks::HookDefinition;
use crate::model::DataDefinition;

pub const CUSTOM_ENTITY: &str = "commons.validate.field.error.customEntity";

/// Cross-field check run after all field validators.
///
/// Returning `false` marks the entity invalid; the validator is expected to
/// have attached an error explaining why.
pub trait EntityValidator: Send + Sync {
    fn validate(&self, definition: &DataDefinition, entity: &mut Entity) -> Result<bool>;
}

/// Bridges an externally supplied predicate hook into the pipeline.
#[derive(Debug, Clone)]
pub struct CustomEntityValidator {
    hook: HookDefinition,
    error_message: String,
}

impl CustomEntityValidator {
    pub fn new(hook: HookDefinition) -> Self {
        Self {
            hook,
            error_message: CUSTOM_ENTITY.to_string(),
        }
    }

    pub fn custom_error_message(mut self, key: impl Into<String>) -> Self {
        self.error_message = key.into();
        self
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn hook(&self) -> &HookDefinition {
        &self.hook
    }
}

impl EntityValidator for CustomEntityValidator {
    fn validate(&self, definition: &DataDefinition, entity: &mut Entity) -> Result<bool> {
        let passed = self.hook.call_with_entity_and_get_boolean(definition, entity)?;
        if !passed {
            entity.add_global_error(ErrorMessage::new(self.error_message.clone()));
        }
        Ok(passed)
    }
}
