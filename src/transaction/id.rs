use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide, strictly increasing transaction identifier. Row versions
/// record the id of the transaction that wrote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub(crate) fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// First id not yet handed out.
    pub(crate) fn next_raw() -> u64 {
        NEXT_TXN_ID.load(Ordering::SeqCst)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_increase() {
        let first = TransactionId::new();
        let second = TransactionId::new();
        assert!(second > first);
        assert!(TransactionId::next_raw() > second.0);
        assert_eq!(TransactionId(7).to_string(), "txn_7");
    }
}
