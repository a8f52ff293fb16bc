//! Shard content hashing.
//!
//! The digest covers every copy table in phase order: the table name, then
//! each row's canonical encoding in key order. Rows are length-prefixed so
//! row boundaries cannot be shifted without changing the digest.

use sha2::{Digest, Sha256};

use crate::models::ShardHash;
use crate::tables::LedgerTable;

/// Incremental SHA-256 over shard rows.
#[derive(Debug, Clone, Default)]
pub struct ShardHasher {
    digest: Sha256,
    rows: u64,
}

impl ShardHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a table section. Must be called before that table's rows.
    pub fn begin_table(&mut self, table: LedgerTable) {
        self.digest.update(b"table:");
        self.digest.update(table.name().as_bytes());
        self.digest.update([0u8]);
    }

    /// Feed one row's canonical encoding.
    pub fn update_row(&mut self, row: &[u8]) {
        self.digest.update((row.len() as u64).to_be_bytes());
        self.digest.update(row);
        self.rows += 1;
    }

    /// Rows fed so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(self) -> ShardHash {
        ShardHash::from_digest(self.digest.finalize().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(tables: Vec<(LedgerTable, Vec<&str>)>) -> ShardHash {
        let mut hasher = ShardHasher::new();
        for (table, rows) in tables {
            hasher.begin_table(table);
            for row in rows {
                hasher.update_row(row.as_bytes());
            }
        }
        hasher.finish()
    }

    #[test]
    fn test_digest_is_32_bytes() {
        let hash = hash_of(vec![(LedgerTable::Block, vec!["row"])]);
        assert_eq!(hash.as_bytes().len(), 32);
    }

    #[test]
    fn test_same_content_same_digest() {
        let a = hash_of(vec![(LedgerTable::Block, vec!["1", "2"])]);
        let b = hash_of(vec![(LedgerTable::Block, vec!["1", "2"])]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_row_order_matters() {
        let a = hash_of(vec![(LedgerTable::Block, vec!["1", "2"])]);
        let b = hash_of(vec![(LedgerTable::Block, vec!["2", "1"])]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_row_boundaries_matter() {
        let a = hash_of(vec![(LedgerTable::Block, vec!["ab", "c"])]);
        let b = hash_of(vec![(LedgerTable::Block, vec!["a", "bc"])]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_table_attribution_matters() {
        let a = hash_of(vec![
            (LedgerTable::Block, vec!["x"]),
            (LedgerTable::Transaction, vec![]),
        ]);
        let b = hash_of(vec![
            (LedgerTable::Block, vec![]),
            (LedgerTable::Transaction, vec!["x"]),
        ]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_counts_rows() {
        let mut hasher = ShardHasher::new();
        hasher.begin_table(LedgerTable::Transaction);
        hasher.update_row(b"a");
        hasher.update_row(b"b");
        assert_eq!(hasher.rows(), 2);
    }
}
