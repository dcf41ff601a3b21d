use super::Entity;
use crate::core::{EntityId, Result};
use crate::model::DataDefinition;
use crate::search::{Restriction, SearchCriteria};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Lazy belongs-to value: a target id that loads its entity on first use.
///
/// Clones share the loaded entity.
#[derive(Clone)]
pub struct LazyEntity {
    target: Arc<DataDefinition>,
    id: EntityId,
    loaded: Arc<OnceCell<Entity>>,
}

impl LazyEntity {
    pub fn new(target: Arc<DataDefinition>, id: EntityId) -> Self {
        Self {
            target,
            id,
            loaded: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) fn with_entity(entity: Entity) -> Option<Self> {
        let id = entity.id()?;
        let target = entity.schema().clone();
        Some(Self {
            target,
            id,
            loaded: Arc::new(OnceCell::new_with(Some(entity))),
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn schema_name(&self) -> &str {
        self.target.name()
    }

    pub fn loaded(&self) -> Option<&Entity> {
        self.loaded.get()
    }

    /// Loads the target once; later calls return the cached entity.
    pub async fn load(&self) -> Result<&Entity> {
        self.loaded.get_or_try_init(|| self.target.get(self.id)).await
    }
}

impl PartialEq for LazyEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.schema_name() == other.schema_name()
    }
}

impl fmt::Debug for LazyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyEntity({}#{}", self.schema_name(), self.id)?;
        if self.loaded().is_some() {
            write!(f, ", loaded")?;
        }
        write!(f, ")")
    }
}

/// Has-many value: the children of one parent, queried on every `fetch`.
#[derive(Clone)]
pub struct EntityList {
    target: Arc<DataDefinition>,
    join_field: String,
    parent_id: Option<EntityId>,
}

impl EntityList {
    pub fn new(target: Arc<DataDefinition>, join_field: impl Into<String>, parent_id: Option<EntityId>) -> Self {
        Self {
            target,
            join_field: join_field.into(),
            parent_id,
        }
    }

    pub fn schema_name(&self) -> &str {
        self.target.name()
    }

    pub fn join_field(&self) -> &str {
        &self.join_field
    }

    pub fn parent_id(&self) -> Option<EntityId> {
        self.parent_id
    }

    /// Criteria selecting the children, in the target's default order.
    pub fn criteria(&self) -> Option<SearchCriteria> {
        let parent_id = self.parent_id?;
        Some(SearchCriteria::new().add(Restriction::belongs_to(self.join_field.clone(), parent_id)))
    }

    pub async fn fetch(&self) -> Result<Vec<Entity>> {
        match self.criteria() {
            Some(criteria) => Ok(self.target.find(criteria).await?.entities),
            None => Ok(Vec::new()),
        }
    }

    pub async fn count(&self) -> Result<usize> {
        match self.criteria() {
            Some(criteria) => Ok(self.target.find(criteria.max_results(0)).await?.total_entities),
            None => Ok(0),
        }
    }
}

impl PartialEq for EntityList {
    fn eq(&self, other: &Self) -> bool {
        self.parent_id == other.parent_id
            && self.join_field == other.join_field
            && self.schema_name() == other.schema_name()
    }
}

impl fmt::Debug for EntityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityList")
            .field("schema", &self.schema_name())
            .field("join_field", &self.join_field)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}
