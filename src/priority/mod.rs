// ============================================================================
// Priority / ranking maintenance
// ============================================================================
//
// Keeps the priority values of every scope (the rows sharing one value of
// the schema's scope field) equal to exactly 1..=N.
//
// Every read-modify-write of a scope happens while the scope's lock is held
// by the current transaction; callers acquire it with `lock` first.
//
// ============================================================================

pub mod locks;

pub use locks::ScopeLocks;

use crate::core::{DataError, EntityId, Result, Row, Value};
use crate::model::DataDefinition;
use crate::storage::{RowPredicate, RowQuery, SortColumn, SortKey};
use crate::transaction::TransactionScope;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Identity of one ranking scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub schema: String,
    pub scope: Option<EntityId>,
}

impl ScopeKey {
    pub fn new(schema: impl Into<String>, scope: Option<EntityId>) -> Self {
        Self {
            schema: schema.into(),
            scope,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(id) => write!(f, "{}[{}]", self.schema, id),
            None => write!(f, "{}[none]", self.schema),
        }
    }
}

/// Storage columns of a ranked schema.
#[derive(Debug, Clone, Copy)]
struct Layout {
    priority: usize,
    scope: usize,
}

pub struct PriorityService {
    locks: ScopeLocks,
    verify: bool,
}

impl PriorityService {
    pub fn new(lock_timeout: Option<Duration>, verify: bool) -> Self {
        Self {
            locks: ScopeLocks::new(lock_timeout),
            verify,
        }
    }

    pub fn locks(&self) -> &ScopeLocks {
        &self.locks
    }

    pub fn scope_of(&self, definition: &DataDefinition, row: &Row) -> Result<Option<EntityId>> {
        let layout = layout(definition)?;
        Ok(row.get(layout.scope).and_then(Value::as_i64))
    }

    pub fn priority_of(&self, definition: &DataDefinition, row: &Row) -> Result<Option<i64>> {
        let layout = layout(definition)?;
        Ok(row.get(layout.priority).and_then(Value::as_i64))
    }

    /// Locks the given scopes of `definition` for the rest of `txn`.
    pub async fn lock(
        &self,
        txn: &mut TransactionScope,
        definition: &DataDefinition,
        scopes: impl IntoIterator<Item = Option<EntityId>>,
    ) -> Result<()> {
        let keys: Vec<ScopeKey> = scopes
            .into_iter()
            .map(|scope| ScopeKey::new(definition.name(), scope))
            .collect();
        self.locks.acquire(txn, keys).await
    }

    /// Priority for a row joining `scope`: one past the current maximum.
    pub async fn next_priority(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        scope: Option<EntityId>,
    ) -> Result<i64> {
        let priorities = self.priorities(txn, definition, scope).await?;
        Ok(priorities.last().copied().unwrap_or(0) + 1)
    }

    /// Closes the gap left by a row that held `removed` in `scope`.
    pub async fn compact(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        scope: Option<EntityId>,
        removed: i64,
    ) -> Result<()> {
        let layout = layout(definition)?;
        let query = scope_query(layout, scope).filter(RowPredicate::Gt(layout.priority, Value::Integer(removed)));
        let shifted = self.shift(txn, definition, layout, &query, -1).await?;
        debug!(schema = definition.name(), ?scope, removed, shifted, "ranking compacted");
        Ok(())
    }

    /// Moves row `id` to `position` within its scope, clamped to `1..=N`,
    /// shifting the rows in between. Returns the position taken.
    pub async fn move_to(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        id: EntityId,
        position: i64,
    ) -> Result<i64> {
        let layout = layout(definition)?;
        let storage = txn.storage();
        let mut row = storage
            .get_by_id(txn.id(), definition.storage_id(), id)
            .await?
            .ok_or_else(|| DataError::EntityNotFound {
                schema: definition.name().to_string(),
                id,
            })?;

        let scope = row[layout.scope].as_i64();
        let current = row[layout.priority].as_i64().ok_or_else(|| {
            DataError::RankingInconsistency {
                scope: ScopeKey::new(definition.name(), scope).to_string(),
                found: Vec::new(),
            }
        })?;
        let count = self.priorities(txn, definition, scope).await?.len() as i64;
        let target = position.clamp(1, count.max(1));
        if target == current {
            return Ok(current);
        }

        let others = RowPredicate::Not(Box::new(RowPredicate::IdEq(id)));
        let (between, step) = if target < current {
            let range = RowPredicate::And(vec![
                RowPredicate::Ge(layout.priority, Value::Integer(target)),
                RowPredicate::Lt(layout.priority, Value::Integer(current)),
            ]);
            (range, 1)
        } else {
            let range = RowPredicate::And(vec![
                RowPredicate::Gt(layout.priority, Value::Integer(current)),
                RowPredicate::Le(layout.priority, Value::Integer(target)),
            ]);
            (range, -1)
        };
        let query = scope_query(layout, scope).filter(others).filter(between);
        self.shift(txn, definition, layout, &query, step).await?;

        row[layout.priority] = Value::Integer(target);
        storage.update(txn.id(), definition.storage_id(), id, row).await?;
        debug!(schema = definition.name(), id, from = current, to = target, "ranking moved");
        Ok(target)
    }

    /// Checks that `scope` holds exactly `1..=N`. No-op unless verification
    /// is enabled.
    pub async fn verify(&self, txn: &TransactionScope, definition: &DataDefinition, scope: Option<EntityId>) -> Result<()> {
        if !self.verify {
            return Ok(());
        }
        let priorities = self.priorities(txn, definition, scope).await?;
        let dense = priorities.iter().zip(1..).all(|(priority, expected)| *priority == expected);
        if !dense {
            let key = ScopeKey::new(definition.name(), scope);
            warn!(scope = %key, ?priorities, "ranking invariant violated");
            return Err(DataError::RankingInconsistency {
                scope: key.to_string(),
                found: priorities,
            });
        }
        Ok(())
    }

    /// Sorted priorities of `scope`. A row without a priority counts as 0,
    /// which `verify` reports.
    pub async fn priorities(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        scope: Option<EntityId>,
    ) -> Result<Vec<i64>> {
        let layout = layout(definition)?;
        let query = scope_query(layout, scope)
            .sort(SortKey::new(SortColumn::Column(layout.priority), false))
            .project(vec![layout.priority]);
        let rows = txn.storage().query(txn.id(), definition.storage_id(), &query).await?;
        let mut priorities: Vec<i64> = rows
            .rows
            .iter()
            .map(|(_, row)| row[0].as_i64().unwrap_or(0))
            .collect();
        priorities.sort_unstable();
        Ok(priorities)
    }

    async fn shift(
        &self,
        txn: &TransactionScope,
        definition: &DataDefinition,
        layout: Layout,
        query: &RowQuery,
        step: i64,
    ) -> Result<usize> {
        let storage = txn.storage();
        let rows = storage.query(txn.id(), definition.storage_id(), query).await?;
        let shifted = rows.rows.len();
        for (id, mut row) in rows.rows {
            if let Some(priority) = row[layout.priority].as_i64() {
                row[layout.priority] = Value::Integer(priority + step);
                storage.update(txn.id(), definition.storage_id(), id, row).await?;
            }
        }
        Ok(shifted)
    }
}

fn layout(definition: &DataDefinition) -> Result<Layout> {
    let not_ranked = || DataError::TypeMismatch(format!("schema '{}' has no priority field", definition.name()));
    let priority = definition.priority_field().ok_or_else(not_ranked)?;
    let scope = definition.scope_field().ok_or_else(not_ranked)?;
    Ok(Layout {
        priority: definition.column_index(priority.name()).ok_or_else(not_ranked)?,
        scope: definition.column_index(scope.name()).ok_or_else(not_ranked)?,
    })
}

fn scope_query(layout: Layout, scope: Option<EntityId>) -> RowQuery {
    RowQuery::default().filter(match scope {
        Some(id) => RowPredicate::Eq(layout.scope, Value::Integer(id)),
        None => RowPredicate::IsNull(layout.scope),
    })
}
