// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transactions over the MVCC storage layer. Rows carry the id of the
// transaction that wrote them; rollback marks the id aborted until storage
// has undone its writes, and every statement reads through a fresh
// read-committed snapshot.
//
// A `TransactionScope` owns one storage transaction plus the ranking-scope
// locks taken inside it, and rolls back on drop unless committed.
//
// ============================================================================

pub mod id;
pub mod manager;
pub mod scope;

pub use id::TransactionId;
pub use manager::TransactionManager;
pub use scope::TransactionScope;
