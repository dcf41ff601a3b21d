// ============================================================================
// MemoData Library
// ============================================================================

pub mod config;
pub mod core;
pub mod data_access;
pub mod entity;
pub mod hooks;
pub mod model;
pub mod priority;
pub mod search;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod validation;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use core::{DataError, EntityId, ResolutionError, Result, SchemaError, Value};
pub use data_access::DataAccessService;
pub use entity::{Entity, EntityList, FieldValue, LazyEntity};
pub use hooks::{Extension, ExtensionId, ExtensionRegistry, HookFactory, InMemoryExtensions};
pub use model::{DataDefinition, DataDefinitionBuilder, FieldDefinition, SchemaRegistry};
pub use search::{Order, Restriction, SearchCriteria, SearchResult};
pub use storage::{InMemoryStorage, Storage};
pub use types::{Cascade, FieldType};
pub use validation::{ErrorMessage, FieldValidator};

use std::sync::Arc;

// ============================================================================
// High-level Engine API
// ============================================================================

/// Entry point: a schema registry and data access service over one storage.
///
/// Schemas registered here can persist themselves; cloning the engine is
/// cheap and shares everything.
///
/// # Examples
///
/// ```
/// use memodata::{DataDefinitionBuilder, DataEngine, FieldType, InMemoryExtensions};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> memodata::Result<()> {
/// let engine = DataEngine::in_memory(Arc::new(InMemoryExtensions::new()));
/// let books = engine
///     .define(
///         DataDefinitionBuilder::new("library.book")
///             .field("title", FieldType::string())
///             .field("price", FieldType::decimal(2)),
///     )
///     .await?;
///
/// let book = books.create().with("title", "Dune")?.with("price", "9.999")?;
/// let saved = engine.save(book).await?;
/// assert!(saved.is_valid());
/// assert_eq!(saved.display("price"), "10.00");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataEngine {
    data_access: Arc<DataAccessService>,
}

impl DataEngine {
    pub fn new(storage: Arc<dyn Storage>, extensions: Arc<dyn ExtensionRegistry>, config: EngineConfig) -> Self {
        Self {
            data_access: DataAccessService::new(storage, extensions, config),
        }
    }

    /// Engine over a fresh in-memory storage with default configuration.
    pub fn in_memory(extensions: Arc<dyn ExtensionRegistry>) -> Self {
        Self::new(Arc::new(InMemoryStorage::new()), extensions, EngineConfig::default())
    }

    /// Registers one schema and creates its table.
    pub async fn define(&self, builder: DataDefinitionBuilder) -> Result<Arc<DataDefinition>> {
        self.data_access.define(builder).await
    }

    /// Registers schemas that reference each other in one atomic batch.
    pub async fn define_all(
        &self,
        builders: impl IntoIterator<Item = DataDefinitionBuilder>,
    ) -> Result<Vec<Arc<DataDefinition>>> {
        self.data_access.define_all(builders).await
    }

    pub fn schema(&self, name: &str) -> Result<Arc<DataDefinition>> {
        self.data_access.schema(name)
    }

    pub fn data_access(&self) -> &Arc<DataAccessService> {
        &self.data_access
    }

    pub fn hooks(&self) -> &Arc<HookFactory> {
        self.data_access.hooks()
    }

    /// Validates and persists an entity. An invalid entity comes back
    /// unsaved with its errors attached.
    pub async fn save(&self, entity: Entity) -> Result<Entity> {
        self.data_access.save(entity).await
    }

    pub async fn get(&self, schema: &str, id: EntityId) -> Result<Entity> {
        self.data_access.get(schema, id).await
    }

    pub async fn find(&self, schema: &str, criteria: SearchCriteria) -> Result<SearchResult> {
        self.data_access.find(schema, criteria).await
    }

    /// Returns `false` if an on-delete hook vetoed.
    pub async fn delete(&self, schema: &str, id: EntityId) -> Result<bool> {
        self.data_access.delete(schema, id).await
    }

    pub async fn move_to(&self, schema: &str, id: EntityId, position: i64) -> Result<i64> {
        self.data_access.move_to(schema, id, position).await
    }

    pub async fn move_by(&self, schema: &str, id: EntityId, offset: i64) -> Result<i64> {
        self.data_access.move_by(schema, id, offset).await
    }
}
