//! Hook dispatch: binds stable extension identifiers to typed callbacks.
//!
//! The [`ExtensionRegistry`] is owned by whoever wires the application
//! together; this module only resolves from it. Resolutions are cached for
//! the lifetime of the [`HookFactory`], invocations are not.

use crate::core::{DataError, ResolutionError, Result};
use crate::entity::{Entity, FieldValue};
use crate::model::{DataDefinition, FieldDefinition};
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Stable identifier of an extension: a component name plus an operation on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionId {
    pub component: String,
    pub method: String,
}

impl ExtensionId {
    pub fn new(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.component, self.method)
    }
}

pub type EntityPredicateFn = dyn Fn(&DataDefinition, &Entity) -> anyhow::Result<bool> + Send + Sync;
pub type EntityListenerFn = dyn Fn(&DataDefinition, &mut Entity) -> anyhow::Result<()> + Send + Sync;
pub type FieldPredicateFn = dyn Fn(&FieldDefinition, &FieldValue) -> anyhow::Result<bool> + Send + Sync;

/// A callable capability, tagged with its call contract.
#[derive(Clone)]
pub enum Extension {
    /// `(Schema, Entity) -> bool`: validation and veto hooks.
    EntityPredicate(Arc<EntityPredicateFn>),
    /// `(Schema, &mut Entity) -> ()`: lifecycle listeners.
    EntityListener(Arc<EntityListenerFn>),
    /// `(Field, value) -> bool`: custom field validators.
    FieldPredicate(Arc<FieldPredicateFn>),
}

impl Extension {
    pub fn entity_predicate<F>(f: F) -> Self
    where
        F: Fn(&DataDefinition, &Entity) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::EntityPredicate(Arc::new(f))
    }

    pub fn entity_listener<F>(f: F) -> Self
    where
        F: Fn(&DataDefinition, &mut Entity) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::EntityListener(Arc::new(f))
    }

    pub fn field_predicate<F>(f: F) -> Self
    where
        F: Fn(&FieldDefinition, &FieldValue) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::FieldPredicate(Arc::new(f))
    }

    pub fn contract(&self) -> &'static str {
        match self {
            Self::EntityPredicate(_) => ENTITY_PREDICATE,
            Self::EntityListener(_) => ENTITY_LISTENER,
            Self::FieldPredicate(_) => FIELD_PREDICATE,
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extension({})", self.contract())
    }
}

const ENTITY_PREDICATE: &str = "entity predicate";
const ENTITY_LISTENER: &str = "entity listener";
const FIELD_PREDICATE: &str = "field predicate";

/// Externally owned lookup of extensions by identifier.
pub trait ExtensionRegistry: Send + Sync {
    fn lookup(&self, id: &ExtensionId) -> Option<Extension>;
}

/// Process-wide registry populated at startup.
#[derive(Default)]
pub struct InMemoryExtensions {
    entries: RwLock<HashMap<ExtensionId, Extension>>,
}

impl InMemoryExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        component: impl Into<String>,
        method: impl Into<String>,
        extension: Extension,
    ) -> Result<()> {
        self.entries
            .write()?
            .insert(ExtensionId::new(component, method), extension);
        Ok(())
    }
}

impl ExtensionRegistry for InMemoryExtensions {
    fn lookup(&self, id: &ExtensionId) -> Option<Extension> {
        self.entries.read().ok()?.get(id).cloned()
    }
}

/// A resolved binding. Cloning shares the callback.
#[derive(Clone, Debug)]
pub struct HookDefinition {
    id: ExtensionId,
    extension: Extension,
}

impl HookDefinition {
    pub fn id(&self) -> &ExtensionId {
        &self.id
    }

    pub fn contract(&self) -> &'static str {
        self.extension.contract()
    }

    pub fn call_with_entity_and_get_boolean(
        &self,
        data_definition: &DataDefinition,
        entity: &Entity,
    ) -> Result<bool> {
        match &self.extension {
            Extension::EntityPredicate(f) => f(data_definition, entity).map_err(|source| self.failed(source)),
            _ => Err(self.mismatch(ENTITY_PREDICATE)),
        }
    }

    pub fn call_with_entity(&self, data_definition: &DataDefinition, entity: &mut Entity) -> Result<()> {
        match &self.extension {
            Extension::EntityListener(f) => f(data_definition, entity).map_err(|source| self.failed(source)),
            _ => Err(self.mismatch(ENTITY_LISTENER)),
        }
    }

    pub fn call_with_field_and_get_boolean(&self, field: &FieldDefinition, value: &FieldValue) -> Result<bool> {
        match &self.extension {
            Extension::FieldPredicate(f) => f(field, value).map_err(|source| self.failed(source)),
            _ => Err(self.mismatch(FIELD_PREDICATE)),
        }
    }

    fn failed(&self, source: anyhow::Error) -> DataError {
        DataError::Hook {
            hook: self.id.clone(),
            source,
        }
    }

    fn mismatch(&self, expected: &'static str) -> DataError {
        ResolutionError::ContractMismatch {
            hook: self.id.clone(),
            expected,
        }
        .into()
    }
}

/// Resolves extension identifiers once and hands out cached bindings.
pub struct HookFactory {
    registry: Arc<dyn ExtensionRegistry>,
    cache: RwLock<HashMap<ExtensionId, HookDefinition>>,
}

impl HookFactory {
    pub fn new(registry: Arc<dyn ExtensionRegistry>) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_hook(&self, component: &str, method: &str) -> Result<HookDefinition> {
        let id = ExtensionId::new(component, method);
        if let Some(hook) = self.cache.read()?.get(&id) {
            return Ok(hook.clone());
        }

        // Lookup runs under the write lock so each id is resolved at most once.
        let mut cache = self.cache.write()?;
        if let Some(hook) = cache.get(&id) {
            return Ok(hook.clone());
        }

        let Some(extension) = self.registry.lookup(&id) else {
            warn!("Unable to resolve hook {}", id);
            return Err(ResolutionError::UnresolvedHook(id).into());
        };

        let hook = HookDefinition {
            id: id.clone(),
            extension,
        };
        cache.insert(id, hook.clone());
        Ok(hook)
    }

    pub fn entity_predicate(&self, component: &str, method: &str) -> Result<HookDefinition> {
        self.get_hook_with_contract(component, method, ENTITY_PREDICATE)
    }

    pub fn entity_listener(&self, component: &str, method: &str) -> Result<HookDefinition> {
        self.get_hook_with_contract(component, method, ENTITY_LISTENER)
    }

    pub fn field_predicate(&self, component: &str, method: &str) -> Result<HookDefinition> {
        self.get_hook_with_contract(component, method, FIELD_PREDICATE)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    fn get_hook_with_contract(&self, component: &str, method: &str, expected: &'static str) -> Result<HookDefinition> {
        let hook = self.get_hook(component, method)?;
        if hook.contract() != expected {
            return Err(hook.mismatch(expected));
        }
        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRegistry {
        inner: InMemoryExtensions,
        lookups: AtomicUsize,
    }

    impl ExtensionRegistry for CountingRegistry {
        fn lookup(&self, id: &ExtensionId) -> Option<Extension> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(id)
        }
    }

    fn registry() -> Arc<CountingRegistry> {
        let inner = InMemoryExtensions::new();
        inner
            .register("orderHooks", "validate", Extension::entity_predicate(|_, _| Ok(true)))
            .unwrap();
        Arc::new(CountingRegistry {
            inner,
            lookups: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_resolution_is_cached() {
        let registry = registry();
        let factory = HookFactory::new(registry.clone());

        let first = factory.get_hook("orderHooks", "validate").unwrap();
        let second = factory.get_hook("orderHooks", "validate").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(factory.cached_count(), 1);
    }

    #[test]
    fn test_unresolved_hook_is_an_error() {
        let factory = HookFactory::new(registry());
        let err = factory.get_hook("orderHooks", "missing").unwrap_err();
        assert!(matches!(
            err,
            DataError::Resolution(ResolutionError::UnresolvedHook(ref id)) if id.method == "missing"
        ));
    }

    #[test]
    fn test_contract_checked_at_resolution() {
        let factory = HookFactory::new(registry());
        assert!(factory.entity_predicate("orderHooks", "validate").is_ok());
        let err = factory.entity_listener("orderHooks", "validate").unwrap_err();
        assert!(matches!(
            err,
            DataError::Resolution(ResolutionError::ContractMismatch { expected: "entity listener", .. })
        ));
    }

    #[test]
    fn test_concurrent_resolution_looks_up_once() {
        let registry = registry();
        let factory = Arc::new(HookFactory::new(registry.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || factory.get_hook("orderHooks", "validate").is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);
    }
}
