//! Column layout of the ledger tables that move into shard stores.
//!
//! Mirrors `migrations/20260101000000_ledger_tables.sql`. Shard tables are
//! created from these definitions and copy statements list these columns,
//! so the two stay in lockstep.

use strata_core::LedgerTable;

/// Batching cursor column present on every ledger table.
pub const KEY_COLUMN: &str = "db_id";

/// Height column used for range selection.
pub const HEIGHT_COLUMN: &str = "height";

/// One column of a shard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    /// Type without constraints; shard stores start unconstrained.
    pub sql_type: &'static str,
    pub nullable: bool,
}

const fn col(name: &'static str, sql_type: &'static str, nullable: bool) -> Column {
    Column {
        name,
        sql_type,
        nullable,
    }
}

const BLOCK: &[Column] = &[
    col("db_id", "BIGINT", false),
    col("id", "BIGINT", false),
    col("version", "INTEGER", false),
    col("timestamp", "INTEGER", false),
    col("previous_block_id", "BIGINT", true),
    col("total_amount", "BIGINT", false),
    col("total_fee", "BIGINT", false),
    col("payload_length", "INTEGER", false),
    col("payload_hash", "BYTEA", false),
    col("generator_id", "BIGINT", false),
    col("block_signature", "BYTEA", false),
    col("height", "BIGINT", false),
];

const TRANSACTION: &[Column] = &[
    col("db_id", "BIGINT", false),
    col("id", "BIGINT", false),
    col("deadline", "SMALLINT", false),
    col("recipient_id", "BIGINT", true),
    col("transaction_index", "SMALLINT", false),
    col("amount", "BIGINT", false),
    col("fee", "BIGINT", false),
    col("full_hash", "BYTEA", false),
    col("height", "BIGINT", false),
    col("block_id", "BIGINT", false),
    col("signature", "BYTEA", true),
    col("timestamp", "INTEGER", false),
    col("type", "SMALLINT", false),
    col("subtype", "SMALLINT", false),
    col("sender_id", "BIGINT", false),
    col("attachment_bytes", "BYTEA", true),
];

/// Columns of a table that is copied into shard stores.
pub fn shard_columns(table: LedgerTable) -> Option<&'static [Column]> {
    match table {
        LedgerTable::Block => Some(BLOCK),
        LedgerTable::Transaction => Some(TRANSACTION),
        _ => None,
    }
}

/// Comma-separated column names, optionally qualified with a table alias.
pub fn column_list(columns: &[Column], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(alias) => format!("{}.{}", alias, c.name),
            None => c.name.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column definitions for `CREATE TABLE`, without keys or constraints.
pub fn column_definitions(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| {
            if c.nullable {
                format!("{} {}", c.name, c.sql_type)
            } else {
                format!("{} {} NOT NULL", c.name, c.sql_type)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_copy_tables_have_shard_columns() {
        assert!(shard_columns(LedgerTable::Block).is_some());
        assert!(shard_columns(LedgerTable::Transaction).is_some());
        assert!(shard_columns(LedgerTable::PublicKey).is_none());
        assert!(shard_columns(LedgerTable::BlockIndex).is_none());
    }

    #[test]
    fn test_copy_tables_carry_key_and_height() {
        for table in [LedgerTable::Block, LedgerTable::Transaction] {
            let columns = shard_columns(table).unwrap();
            assert_eq!(columns[0].name, KEY_COLUMN);
            assert!(columns.iter().any(|c| c.name == HEIGHT_COLUMN));
        }
    }

    #[test]
    fn test_column_rendering() {
        let columns = &BLOCK[..2];
        assert_eq!(column_list(columns, None), "db_id, id");
        assert_eq!(column_list(columns, Some("b")), "b.db_id, b.id");
        assert_eq!(
            column_definitions(&BLOCK[3..5]),
            "timestamp INTEGER NOT NULL, previous_block_id BIGINT"
        );
    }
}
