use super::ScopeKey;
use crate::core::{DataError, Result};
use crate::transaction::TransactionScope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as ScopeMutex;
use tracing::debug;

/// One async mutex per ranking scope.
///
/// Guards are parked in the transaction scope, so a ranking scope stays
/// locked until the transaction that touched it commits or rolls back.
/// Entries nobody holds or waits on are swept whenever a mutex is handed
/// out, so the map only ever holds scopes in use.
pub struct ScopeLocks {
    locks: Mutex<HashMap<ScopeKey, Arc<ScopeMutex<()>>>>,
    timeout: Option<Duration>,
}

impl ScopeLocks {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Locks every key not already held by `txn`, in key order.
    pub async fn acquire(&self, txn: &mut TransactionScope, keys: impl IntoIterator<Item = ScopeKey>) -> Result<()> {
        let mut keys: Vec<ScopeKey> = keys
            .into_iter()
            .filter(|key| !txn.holds_lock(&key.to_string()))
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let mutex = self.mutex(&key)?;
            let guard = match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, mutex.lock_owned())
                    .await
                    .map_err(|_| DataError::LockTimeout(key.to_string()))?,
                None => mutex.lock_owned().await,
            };
            debug!(scope = %key, txn = %txn.id(), "ranking scope locked");
            txn.hold_lock(key.to_string(), guard);
        }
        Ok(())
    }

    /// Scopes currently in the map.
    pub fn scope_count(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn mutex(&self, key: &ScopeKey) -> Result<Arc<ScopeMutex<()>>> {
        let mut locks = self.locks.lock()?;
        // the map's own reference is the only one left once a scope is idle
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        Ok(locks.entry(key.clone()).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn key(scope: Option<i64>) -> ScopeKey {
        ScopeKey::new("tasks.task", scope)
    }

    #[tokio::test]
    async fn test_second_transaction_times_out() {
        let storage = Arc::new(InMemoryStorage::new());
        let locks = ScopeLocks::new(Some(Duration::from_millis(20)));

        let mut first = TransactionScope::begin(storage.clone()).await.unwrap();
        locks.acquire(&mut first, [key(Some(1))]).await.unwrap();

        let mut second = TransactionScope::begin(storage.clone()).await.unwrap();
        let err = locks.acquire(&mut second, [key(Some(1))]).await.unwrap_err();
        assert!(matches!(err, DataError::LockTimeout(ref scope) if scope == "tasks.task[1]"));

        // other scopes are independent
        locks.acquire(&mut second, [key(None)]).await.unwrap();

        first.commit().await.unwrap();
        locks.acquire(&mut second, [key(Some(1))]).await.unwrap();
        assert_eq!(second.held_lock_count(), 2);
        assert_eq!(locks.scope_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_scopes_are_swept() {
        let storage = Arc::new(InMemoryStorage::new());
        let locks = ScopeLocks::new(Some(Duration::from_millis(20)));

        for scope in 1..=50 {
            let mut txn = TransactionScope::begin(storage.clone()).await.unwrap();
            locks.acquire(&mut txn, [key(Some(scope))]).await.unwrap();
            txn.commit().await.unwrap();
        }
        assert_eq!(locks.scope_count(), 1);

        let mut held = TransactionScope::begin(storage.clone()).await.unwrap();
        locks.acquire(&mut held, [key(Some(1))]).await.unwrap();
        let mut other = TransactionScope::begin(storage.clone()).await.unwrap();
        locks.acquire(&mut other, [key(Some(2))]).await.unwrap();
        // a held scope survives the sweep and still excludes others
        assert_eq!(locks.scope_count(), 2);
        let mut third = TransactionScope::begin(storage).await.unwrap();
        assert!(locks.acquire(&mut third, [key(Some(1))]).await.is_err());
    }

    #[tokio::test]
    async fn test_reacquire_in_same_transaction_is_noop() {
        let storage = Arc::new(InMemoryStorage::new());
        let locks = ScopeLocks::new(Some(Duration::from_millis(20)));

        let mut txn = TransactionScope::begin(storage).await.unwrap();
        locks.acquire(&mut txn, [key(Some(2)), key(Some(1)), key(Some(2))]).await.unwrap();
        locks.acquire(&mut txn, [key(Some(1))]).await.unwrap();
        assert_eq!(txn.held_lock_count(), 2);
    }
}
