pub mod memory;
pub mod pattern;
pub mod query;
pub mod table;

pub use memory::InMemoryStorage;
pub use query::{NullOrdering, RowPredicate, RowQuery, RowSet, SortColumn, SortKey};
pub use table::{Table, TableSchema};

use crate::core::{EntityId, Result, Row};
use crate::transaction::TransactionId;
use async_trait::async_trait;

/// Transactional row store the data access layer persists through.
///
/// Every read and write names the transaction it belongs to. `rollback` is
/// synchronous so that an abandoned transaction scope can release itself
/// from `Drop`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_table(&self, schema: TableSchema) -> Result<()>;

    async fn create_index(&self, table: &str, column: &str) -> Result<()>;

    async fn begin(&self) -> Result<TransactionId>;

    async fn commit(&self, txn: TransactionId) -> Result<()>;

    fn rollback(&self, txn: TransactionId) -> Result<()>;

    async fn get_by_id(&self, txn: TransactionId, table: &str, id: EntityId) -> Result<Option<Row>>;

    async fn insert(&self, txn: TransactionId, table: &str, row: Row) -> Result<EntityId>;

    /// Returns `false` if the row no longer exists.
    async fn update(&self, txn: TransactionId, table: &str, id: EntityId, row: Row) -> Result<bool>;

    /// Returns `false` if the row no longer exists.
    async fn delete(&self, txn: TransactionId, table: &str, id: EntityId) -> Result<bool>;

    async fn query(&self, txn: TransactionId, table: &str, query: &RowQuery) -> Result<RowSet>;
}
