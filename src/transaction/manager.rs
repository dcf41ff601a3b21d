// ============================================================================
// Transaction Manager
// ============================================================================

use super::TransactionId;
use crate::core::{DataError, Result, Snapshot};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Active and aborted id sets. Both are Copy-on-Write so snapshots can share
/// them without holding the lock. An aborted id stays only until storage has
/// undone its writes.
#[derive(Default)]
struct Registry {
    active: Arc<HashSet<u64>>,
    aborted: Arc<HashSet<u64>>,
}

/// Tracks which transactions are in flight and which were aborted.
///
/// Id allocation and insertion into the active set happen under one write
/// lock, and snapshots read the id high-water mark under the read lock, so a
/// snapshot can never mistake a just-started transaction for a committed one.
#[derive(Default)]
pub struct TransactionManager {
    registry: RwLock<Registry>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Result<TransactionId> {
        let mut registry = self.registry.write()?;
        let transaction_id = TransactionId::new();

        let mut active = (*registry.active).clone();
        active.insert(transaction_id.0);
        registry.active = Arc::new(active);

        Ok(transaction_id)
    }

    /// Read-committed snapshot: committed rows plus this transaction's own.
    pub fn snapshot(&self, txn_id: TransactionId) -> Result<Snapshot> {
        let registry = self.registry.read()?;
        Ok(Snapshot {
            tx_id: txn_id.0,
            active: registry.active.clone(),
            aborted: registry.aborted.clone(),
            max_tx_id: TransactionId::next_raw(),
        })
    }

    pub fn is_active(&self, txn_id: TransactionId) -> Result<bool> {
        Ok(self.registry.read()?.active.contains(&txn_id.0))
    }

    pub fn is_aborted(&self, txn_id: TransactionId) -> Result<bool> {
        Ok(self.registry.read()?.aborted.contains(&txn_id.0))
    }

    pub fn aborted_count(&self) -> Result<usize> {
        Ok(self.registry.read()?.aborted.len())
    }

    pub fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut registry = self.registry.write()?;
        if !registry.active.contains(&txn_id.0) {
            return Err(DataError::Persistence(format!(
                "Transaction {} is not active",
                txn_id
            )));
        }

        let mut active = (*registry.active).clone();
        active.remove(&txn_id.0);
        registry.active = Arc::new(active);
        Ok(())
    }

    /// Returns `false`, changing nothing, if the transaction already finished.
    pub fn rollback(&self, txn_id: TransactionId) -> Result<bool> {
        let mut registry = self.registry.write()?;
        if !registry.active.contains(&txn_id.0) {
            return Ok(false);
        }

        let mut active = (*registry.active).clone();
        active.remove(&txn_id.0);
        registry.active = Arc::new(active);

        let mut aborted = (*registry.aborted).clone();
        aborted.insert(txn_id.0);
        registry.aborted = Arc::new(aborted);
        Ok(true)
    }

    /// Drops aborted ids once no row version refers to them any more.
    pub fn forget_aborted(&self, txn_ids: &[TransactionId]) -> Result<()> {
        let mut registry = self.registry.write()?;
        let mut aborted = (*registry.aborted).clone();
        for txn_id in txn_ids {
            aborted.remove(&txn_id.0);
        }
        registry.aborted = Arc::new(aborted);
        Ok(())
    }
}
