use super::TransactionId;
use crate::core::Result;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// One storage transaction and the scope locks acquired inside it.
///
/// Locks are released only after the transaction commits or rolls back, so
/// the next holder always reads the committed result of the previous one.
pub struct TransactionScope {
    storage: Arc<dyn Storage>,
    id: TransactionId,
    finished: bool,
    locks: HashMap<String, OwnedMutexGuard<()>>,
}

impl TransactionScope {
    pub async fn begin(storage: Arc<dyn Storage>) -> Result<Self> {
        let id = storage.begin().await?;
        debug!(txn = %id, "transaction started");
        Ok(Self {
            storage,
            id,
            finished: false,
            locks: HashMap::new(),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn holds_lock(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// Keeps `guard` alive until the transaction ends.
    pub fn hold_lock(&mut self, key: String, guard: OwnedMutexGuard<()>) {
        self.locks.insert(key, guard);
    }

    pub fn held_lock_count(&self) -> usize {
        self.locks.len()
    }

    pub async fn commit(mut self) -> Result<()> {
        self.storage.commit(self.id).await?;
        self.finished = true;
        debug!(txn = %self.id, locks = self.locks.len(), "transaction committed");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.storage.rollback(self.id)?;
        debug!(txn = %self.id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.storage.rollback(self.id) {
            Ok(()) => warn!(txn = %self.id, "transaction abandoned, rolled back"),
            Err(err) => warn!(txn = %self.id, error = %err, "rollback of abandoned transaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Value};
    use crate::storage::{InMemoryStorage, TableSchema};
    use tokio::sync::Mutex;

    async fn storage() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .create_table(TableSchema::new("items", vec![Column::new("name", DataType::Text)]))
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let storage = storage().await;
        let txn_id = {
            let scope = TransactionScope::begin(storage.clone()).await.unwrap();
            scope
                .storage()
                .insert(scope.id(), "items", vec![Value::from("a")])
                .await
                .unwrap();
            scope.id()
        };

        assert!(storage.transaction_manager().is_aborted(txn_id).unwrap());
        let reader = storage.begin().await.unwrap();
        assert!(storage.get_by_id(reader, "items", 1).await.unwrap().is_none());
        // the next begin undid the abandoned write
        assert!(!storage.transaction_manager().is_aborted(txn_id).unwrap());
        assert_eq!(storage.row_count("items").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locks_released_after_commit() {
        let storage = storage().await;
        let lock = Arc::new(Mutex::new(()));

        let mut scope = TransactionScope::begin(storage.clone()).await.unwrap();
        scope.hold_lock("items".to_string(), lock.clone().lock_owned().await);
        assert!(scope.holds_lock("items"));
        assert!(lock.try_lock().is_err());

        let txn_id = scope.id();
        scope.commit().await.unwrap();
        assert!(lock.try_lock().is_ok());
        assert!(!storage.transaction_manager().is_active(txn_id).unwrap());
    }
}
