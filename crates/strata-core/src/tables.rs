//! Ledger tables taking part in shard migration and the data phases that
//! move them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::MigrateState;

/// The fixed set of main-store tables a shard run touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTable {
    Block,
    Transaction,
    BlockIndex,
    TransactionShardIndex,
    PublicKey,
    GenesisPublicKey,
    ShufflingData,
    DataTag,
    PrunableMessage,
}

impl LedgerTable {
    pub const ALL: [LedgerTable; 9] = [
        LedgerTable::Block,
        LedgerTable::Transaction,
        LedgerTable::BlockIndex,
        LedgerTable::TransactionShardIndex,
        LedgerTable::PublicKey,
        LedgerTable::GenesisPublicKey,
        LedgerTable::ShufflingData,
        LedgerTable::DataTag,
        LedgerTable::PrunableMessage,
    ];

    /// Table name in the store.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerTable::Block => "block",
            LedgerTable::Transaction => "transaction",
            LedgerTable::BlockIndex => "block_index",
            LedgerTable::TransactionShardIndex => "transaction_shard_index",
            LedgerTable::PublicKey => "public_key",
            LedgerTable::GenesisPublicKey => "genesis_public_key",
            LedgerTable::ShufflingData => "shuffling_data",
            LedgerTable::DataTag => "data_tag",
            LedgerTable::PrunableMessage => "prunable_message",
        }
    }

    /// For an index table, the copied table its rows are built from.
    pub fn index_source(&self) -> Option<LedgerTable> {
        match self {
            LedgerTable::BlockIndex => Some(LedgerTable::Block),
            LedgerTable::TransactionShardIndex => Some(LedgerTable::Transaction),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LedgerTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LedgerTable::ALL
            .iter()
            .find(|t| t.name() == s)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("unknown ledger table: {}", s)))
    }
}

/// The four batched data-movement phases of a shard run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPhase {
    /// Copy rows below the boundary into the shard store.
    Copy,
    /// Point retained derived rows at the snapshot block.
    Relink,
    /// Record moved ids in the secondary index tables.
    Index,
    /// Remove copied rows from the main store.
    Delete,
}

impl DataPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataPhase::Copy => "copy",
            DataPhase::Relink => "relink",
            DataPhase::Index => "index",
            DataPhase::Delete => "delete",
        }
    }

    /// Tables this phase must cover before the run may advance, in the order
    /// they are processed.
    pub fn tables(&self) -> &'static [LedgerTable] {
        match self {
            DataPhase::Copy => &[LedgerTable::Block, LedgerTable::Transaction],
            DataPhase::Relink => &[
                LedgerTable::GenesisPublicKey,
                LedgerTable::PublicKey,
                LedgerTable::ShufflingData,
                LedgerTable::DataTag,
                LedgerTable::PrunableMessage,
            ],
            DataPhase::Index => &[LedgerTable::BlockIndex, LedgerTable::TransactionShardIndex],
            // children before parents so no delete relies on cascades
            DataPhase::Delete => &[LedgerTable::Transaction, LedgerTable::Block],
        }
    }

    /// State the run must be in for this phase to start.
    pub fn required_state(&self) -> MigrateState {
        match self {
            DataPhase::Copy => MigrateState::ShardSchemaFull,
            DataPhase::Relink => MigrateState::DataCopiedToShard,
            DataPhase::Index => MigrateState::DataRelinkedInMain,
            DataPhase::Delete => MigrateState::SecondaryIndexUpdated,
        }
    }

    /// State recorded once every table of the phase is complete.
    pub fn target_state(&self) -> MigrateState {
        match self {
            DataPhase::Copy => MigrateState::DataCopiedToShard,
            DataPhase::Relink => MigrateState::DataRelinkedInMain,
            DataPhase::Index => MigrateState::SecondaryIndexUpdated,
            DataPhase::Delete => MigrateState::DataRemovedFromMain,
        }
    }

    /// Operation name used in logs and transition errors.
    pub fn operation(&self) -> &'static str {
        match self {
            DataPhase::Copy => "copy_data_to_shard",
            DataPhase::Relink => "relink_data_to_snapshot_block",
            DataPhase::Index => "update_secondary_index",
            DataPhase::Delete => "delete_copied_data",
        }
    }

    /// Table that must be finished within this phase before `table` may
    /// start. Tables without one are independent and may run concurrently.
    pub fn prerequisite(&self, table: LedgerTable) -> Option<LedgerTable> {
        match (self, table) {
            // shard transactions reference shard blocks
            (DataPhase::Copy, LedgerTable::Transaction) => Some(LedgerTable::Block),
            (DataPhase::Delete, LedgerTable::Block) => Some(LedgerTable::Transaction),
            _ => None,
        }
    }

    /// Whether the phase writes to tables that block acceptance also writes.
    pub fn touches_chain_tables(&self) -> bool {
        matches!(self, DataPhase::Copy | DataPhase::Index | DataPhase::Delete)
    }

    /// Wrap a store failure in this phase's error kind.
    pub fn failure(&self, table: LedgerTable, err: &Error) -> Error {
        let message = format!("{}: {}", table, err);
        match self {
            DataPhase::Copy => Error::Copy {
                table: table.name().to_string(),
                message: err.to_string(),
            },
            DataPhase::Relink => Error::Relink(message),
            DataPhase::Index => Error::Index(message),
            DataPhase::Delete => Error::Delete(message),
        }
    }
}

impl fmt::Display for DataPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "copy" => Ok(DataPhase::Copy),
            "relink" => Ok(DataPhase::Relink),
            "index" => Ok(DataPhase::Index),
            "delete" => Ok(DataPhase::Delete),
            other => Err(Error::InvalidInput(format!("unknown data phase: {}", other))),
        }
    }
}
