use super::{RowQuery, RowSet, Storage, Table, TableSchema};
use crate::core::{DataError, EntityId, Result, Row};
use crate::transaction::{TransactionId, TransactionManager};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::RwLock as TableLock;
use tracing::debug;

/// Rows written by one transaction, by table.
type WriteSet = BTreeSet<(String, EntityId)>;

/// MVCC in-memory storage.
///
/// Old versions are reclaimed per write set: a commit prunes the versions it
/// superseded, and the writes of a rolled-back transaction are undone by the
/// next `begin` or `commit`, after which its id is forgotten.
pub struct InMemoryStorage {
    /// Tables with individual locks; the map lock only guards the table set.
    tables: RwLock<HashMap<String, Arc<TableLock<Table>>>>,
    transactions: TransactionManager,
    writes: Mutex<HashMap<u64, WriteSet>>,
    rolled_back: Mutex<Vec<(TransactionId, WriteSet)>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            transactions: TransactionManager::new(),
            writes: Mutex::new(HashMap::new()),
            rolled_back: Mutex::new(Vec::new()),
        }
    }

    /// Handle on a table for concurrent access.
    pub fn get_table(&self, name: &str) -> Result<Arc<TableLock<Table>>> {
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::Persistence(format!("Table '{}' not found", name)))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables
            .read()
            .map(|tables| tables.contains_key(name))
            .unwrap_or(false)
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables
            .read()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of row chains, including ones invisible to any snapshot.
    pub async fn row_count(&self, table_name: &str) -> Result<usize> {
        let table_handle = self.get_table(table_name)?;
        let table = table_handle.read().await;
        Ok(table.row_count())
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.transactions
    }

    fn record_write(&self, txn: TransactionId, table: &str, id: EntityId) -> Result<()> {
        self.writes
            .lock()?
            .entry(txn.0)
            .or_default()
            .insert((table.to_string(), id));
        Ok(())
    }

    fn take_writes(&self, txn: TransactionId) -> Result<WriteSet> {
        Ok(self.writes.lock()?.remove(&txn.0).unwrap_or_default())
    }

    /// Undoes the writes of rolled-back transactions, then drops their ids
    /// from the aborted set.
    async fn reclaim_rolled_back(&self) -> Result<()> {
        let pending = mem::take(&mut *self.rolled_back.lock()?);
        if pending.is_empty() {
            return Ok(());
        }
        for (txn, writes) in &pending {
            for (table_name, id) in writes {
                let table_handle = self.get_table(table_name)?;
                table_handle.write().await.discard(*id, txn.0);
            }
        }
        let ids: Vec<TransactionId> = pending.iter().map(|(txn, _)| *txn).collect();
        self.transactions.forget_aborted(&ids)?;
        debug!(transactions = ids.len(), "rolled-back writes reclaimed");
        Ok(())
    }

    async fn prune(&self, txn: TransactionId, writes: WriteSet) -> Result<()> {
        for (table_name, id) in writes {
            let table_handle = self.get_table(&table_name)?;
            let mut table = table_handle.write().await;
            let snapshot = self.transactions.snapshot(txn)?;
            table.prune(id, &snapshot);
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let name = schema.name().to_string();
        let mut tables = self.tables.write()?;
        if tables.contains_key(&name) {
            return Err(DataError::Persistence(format!("Table '{}' already exists", name)));
        }
        tables.insert(name, Arc::new(TableLock::new(Table::new(schema))));
        Ok(())
    }

    async fn create_index(&self, table_name: &str, column_name: &str) -> Result<()> {
        let table_handle = self.get_table(table_name)?;
        let mut table = table_handle.write().await;
        table.create_index(column_name)
    }

    async fn begin(&self) -> Result<TransactionId> {
        self.reclaim_rolled_back().await?;
        self.transactions.begin()
    }

    async fn commit(&self, txn: TransactionId) -> Result<()> {
        self.transactions.commit(txn)?;
        let writes = self.take_writes(txn)?;
        self.prune(txn, writes).await?;
        self.reclaim_rolled_back().await
    }

    fn rollback(&self, txn: TransactionId) -> Result<()> {
        if !self.transactions.rollback(txn)? {
            return Ok(());
        }
        let writes = self.take_writes(txn)?;
        self.rolled_back.lock()?.push((txn, writes));
        Ok(())
    }

    async fn get_by_id(&self, txn: TransactionId, table_name: &str, id: EntityId) -> Result<Option<Row>> {
        let table_handle = self.get_table(table_name)?;
        let table = table_handle.read().await;
        let snapshot = self.transactions.snapshot(txn)?;
        Ok(table.get_visible_row(id, &snapshot))
    }

    async fn insert(&self, txn: TransactionId, table_name: &str, row: Row) -> Result<EntityId> {
        let table_handle = self.get_table(table_name)?;
        let mut table = table_handle.write().await;
        let snapshot = self.transactions.snapshot(txn)?;
        let id = table.insert(row, &snapshot)?;
        self.record_write(txn, table_name, id)?;
        Ok(id)
    }

    async fn update(&self, txn: TransactionId, table_name: &str, id: EntityId, row: Row) -> Result<bool> {
        let table_handle = self.get_table(table_name)?;
        let mut table = table_handle.write().await;
        let snapshot = self.transactions.snapshot(txn)?;
        let updated = table.update(id, row, &snapshot)?;
        if updated {
            self.record_write(txn, table_name, id)?;
        }
        Ok(updated)
    }

    async fn delete(&self, txn: TransactionId, table_name: &str, id: EntityId) -> Result<bool> {
        let table_handle = self.get_table(table_name)?;
        let mut table = table_handle.write().await;
        let snapshot = self.transactions.snapshot(txn)?;
        let deleted = table.delete(id, &snapshot)?;
        if deleted {
            self.record_write(txn, table_name, id)?;
        }
        Ok(deleted)
    }

    async fn query(&self, txn: TransactionId, table_name: &str, query: &RowQuery) -> Result<RowSet> {
        let table_handle = self.get_table(table_name)?;
        let table = table_handle.read().await;
        let snapshot = self.transactions.snapshot(txn)?;

        let indexed = query.predicate.as_ref().and_then(|predicate| {
            let (column, value) = predicate.index_lookup()?;
            let column_name = &table.schema().columns()[column].name;
            table.index_candidates(column_name, value)
        });

        let candidates = match indexed {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| table.get_visible_row(id, &snapshot).map(|row| (id, row)))
                .collect(),
            None => table.scan_with_ids(&snapshot),
        };

        let mut matched = Vec::with_capacity(candidates.len());
        for (id, row) in candidates {
            if query.matches(id, &row)? {
                matched.push((id, row));
            }
        }

        Ok(query.finish(matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Value};
    use crate::storage::{RowPredicate, SortColumn, SortKey};

    async fn storage() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage
            .create_table(TableSchema::new(
                "items",
                vec![Column::new("name", DataType::Text), Column::new("parent", DataType::Integer)],
            ))
            .await
            .unwrap();
        storage.create_index("items", "parent").await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let storage = storage().await;
        let writer = storage.begin().await.unwrap();
        let id = storage
            .insert(writer, "items", vec![Value::from("a"), Value::Integer(1)])
            .await
            .unwrap();

        let reader = storage.begin().await.unwrap();
        assert!(storage.get_by_id(reader, "items", id).await.unwrap().is_none());

        storage.commit(writer).await.unwrap();
        // read-committed: the same reader now sees it
        assert!(storage.get_by_id(reader, "items", id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let storage = storage().await;
        let writer = storage.begin().await.unwrap();
        let id = storage
            .insert(writer, "items", vec![Value::from("a"), Value::Integer(1)])
            .await
            .unwrap();
        storage.rollback(writer).unwrap();
        assert!(storage.transaction_manager().is_aborted(writer).unwrap());

        let reader = storage.begin().await.unwrap();
        assert!(storage.get_by_id(reader, "items", id).await.unwrap().is_none());
        assert_eq!(storage.row_count("items").await.unwrap(), 0);
        assert_eq!(storage.transaction_manager().aborted_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_prunes_superseded_versions() {
        let storage = storage().await;
        let writer = storage.begin().await.unwrap();
        let kept = storage
            .insert(writer, "items", vec![Value::from("a"), Value::Integer(1)])
            .await
            .unwrap();
        let gone = storage
            .insert(writer, "items", vec![Value::from("b"), Value::Integer(2)])
            .await
            .unwrap();
        storage.commit(writer).await.unwrap();

        let editor = storage.begin().await.unwrap();
        storage
            .update(editor, "items", kept, vec![Value::from("a2"), Value::Integer(1)])
            .await
            .unwrap();
        assert!(storage.delete(editor, "items", gone).await.unwrap());
        storage.commit(editor).await.unwrap();

        assert_eq!(storage.row_count("items").await.unwrap(), 1);
        let table = storage.get_table("items").unwrap();
        assert_eq!(table.read().await.version_count(kept), 1);
        assert_eq!(
            table.read().await.index_candidates("parent", &Value::Integer(2)),
            Some(vec![])
        );

        let reader = storage.begin().await.unwrap();
        assert_eq!(
            storage.get_by_id(reader, "items", kept).await.unwrap(),
            Some(vec![Value::from("a2"), Value::Integer(1)])
        );
        assert!(storage.get_by_id(reader, "items", gone).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rolled_back_update_restores_row_and_is_forgotten() {
        let storage = storage().await;
        let writer = storage.begin().await.unwrap();
        let id = storage
            .insert(writer, "items", vec![Value::from("a"), Value::Integer(1)])
            .await
            .unwrap();
        storage.commit(writer).await.unwrap();

        let editor = storage.begin().await.unwrap();
        storage
            .update(editor, "items", id, vec![Value::from("a"), Value::Integer(9)])
            .await
            .unwrap();
        storage.rollback(editor).unwrap();

        let reader = storage.begin().await.unwrap();
        assert_eq!(storage.transaction_manager().aborted_count().unwrap(), 0);
        let table = storage.get_table("items").unwrap();
        assert_eq!(table.read().await.version_count(id), 1);
        assert_eq!(
            storage.get_by_id(reader, "items", id).await.unwrap(),
            Some(vec![Value::from("a"), Value::Integer(1)])
        );
        // the row is writable again
        assert!(storage
            .update(reader, "items", id, vec![Value::from("b"), Value::Integer(1)])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_indexed_query() {
        let storage = storage().await;
        let txn = storage.begin().await.unwrap();
        for (name, parent) in [("a", 1), ("b", 2), ("c", 1)] {
            storage
                .insert(txn, "items", vec![Value::from(name), Value::Integer(parent)])
                .await
                .unwrap();
        }

        let query = RowQuery::default()
            .filter(RowPredicate::Eq(1, Value::Integer(1)))
            .sort(SortKey::new(SortColumn::Column(0), true));
        let set = storage.query(txn, "items", &query).await.unwrap();
        let names: Vec<_> = set.rows.iter().map(|(_, row)| row[0].clone()).collect();
        assert_eq!(names, vec![Value::from("c"), Value::from("a")]);
        assert_eq!(set.total, 2);
    }

    #[tokio::test]
    async fn test_duplicate_table_rejected() {
        let storage = storage().await;
        let result = storage.create_table(TableSchema::new("items", vec![])).await;
        assert!(matches!(result, Err(DataError::Persistence(_))));
        assert!(storage.table_exists("items"));
        assert_eq!(storage.list_tables(), vec!["items".to_string()]);
    }
}
