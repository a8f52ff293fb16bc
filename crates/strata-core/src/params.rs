//! Per-phase command parameters.
//!
//! Each phase call takes its own parameter struct, so a finalization hash can
//! only be passed to finalization and table lists are checked against the
//! phase they are meant for.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::ShardHash;
use crate::schema_version::ShardSchemaVersion;
use crate::tables::{DataPhase, LedgerTable};

/// Table list, batch size and time budget for one batched phase call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBatchParams {
    tables: Vec<LedgerTable>,
    batch_size: u32,
    time_budget: Duration,
}

impl TableBatchParams {
    fn new(
        phase: DataPhase,
        tables: Vec<LedgerTable>,
        batch_size: u32,
        time_budget: Duration,
    ) -> Result<Self> {
        if tables.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} requires at least one table",
                phase.operation()
            )));
        }
        if batch_size == 0 || batch_size > defaults::BATCH_SIZE_MAX {
            return Err(Error::InvalidInput(format!(
                "batch size must be between 1 and {}, got {}",
                defaults::BATCH_SIZE_MAX,
                batch_size
            )));
        }
        if time_budget.is_zero() {
            return Err(Error::InvalidInput("time budget must be positive".to_string()));
        }
        let allowed = phase.tables();
        if let Some(stray) = tables.iter().find(|t| !allowed.contains(t)) {
            return Err(Error::InvalidInput(format!(
                "table {} is not part of the {} phase",
                stray, phase
            )));
        }

        // Keep the phase's processing order and drop duplicates.
        let ordered = allowed
            .iter()
            .filter(|t| tables.contains(t))
            .copied()
            .collect();

        Ok(Self {
            tables: ordered,
            batch_size,
            time_budget,
        })
    }

    pub fn tables(&self) -> &[LedgerTable] {
        &self.tables
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }
}

macro_rules! phase_params {
    ($(#[$doc:meta])* $name:ident, $phase:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(TableBatchParams);

        impl $name {
            pub const PHASE: DataPhase = $phase;

            /// Parameters for an explicit table subset.
            pub fn new(
                tables: Vec<LedgerTable>,
                batch_size: u32,
                time_budget: Duration,
            ) -> Result<Self> {
                TableBatchParams::new(Self::PHASE, tables, batch_size, time_budget).map(Self)
            }

            /// Parameters covering every table of the phase with default
            /// batch size and budget.
            pub fn all() -> Self {
                Self(TableBatchParams {
                    tables: Self::PHASE.tables().to_vec(),
                    batch_size: defaults::BATCH_SIZE,
                    time_budget: Duration::from_millis(defaults::TIME_BUDGET_MS),
                })
            }

            /// Parameters covering every table of the phase.
            pub fn all_with(batch_size: u32, time_budget: Duration) -> Result<Self> {
                Self::new(Self::PHASE.tables().to_vec(), batch_size, time_budget)
            }

            pub fn batch(&self) -> &TableBatchParams {
                &self.0
            }
        }
    };
}

phase_params!(
    /// Parameters for `copy_data_to_shard`.
    CopyParams,
    DataPhase::Copy
);
phase_params!(
    /// Parameters for `relink_data_to_snapshot_block`.
    RelinkParams,
    DataPhase::Relink
);
phase_params!(
    /// Parameters for `update_secondary_index`.
    IndexParams,
    DataPhase::Index
);
phase_params!(
    /// Parameters for `delete_copied_data`.
    DeleteParams,
    DataPhase::Delete
);

/// Parameters for `add_shard_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeParams {
    shard_hash: ShardHash,
}

impl FinalizeParams {
    pub fn new(shard_hash: ShardHash) -> Self {
        Self { shard_hash }
    }

    /// Build from raw bytes; empty input is rejected.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        ShardHash::new(bytes).map(Self::new)
    }

    pub fn shard_hash(&self) -> &ShardHash {
        &self.shard_hash
    }
}

/// One orchestrator phase call with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseCommand {
    CreateSchema(ShardSchemaVersion),
    Copy(CopyParams),
    Relink(RelinkParams),
    UpdateIndex(IndexParams),
    Delete(DeleteParams),
    Finalize(FinalizeParams),
}

impl PhaseCommand {
    /// Operation name used in logs and transition errors.
    pub fn operation(&self) -> &'static str {
        match self {
            PhaseCommand::CreateSchema(_) => "add_or_create_shard",
            PhaseCommand::Copy(_) => DataPhase::Copy.operation(),
            PhaseCommand::Relink(_) => DataPhase::Relink.operation(),
            PhaseCommand::UpdateIndex(_) => DataPhase::Index.operation(),
            PhaseCommand::Delete(_) => DataPhase::Delete.operation(),
            PhaseCommand::Finalize(_) => "add_shard_info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> Duration {
        Duration::from_millis(8000)
    }

    #[test]
    fn test_copy_params_keep_phase_order() {
        let params = CopyParams::new(
            vec![LedgerTable::Transaction, LedgerTable::Block, LedgerTable::Block],
            100,
            budget(),
        )
        .unwrap();
        assert_eq!(
            params.batch().tables(),
            &[LedgerTable::Block, LedgerTable::Transaction]
        );
        assert_eq!(params.batch().batch_size(), 100);
        assert_eq!(params.batch().time_budget(), budget());
    }

    #[test]
    fn test_rejects_table_from_another_phase() {
        let err = CopyParams::new(vec![LedgerTable::PublicKey], 100, budget()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(RelinkParams::new(vec![LedgerTable::Block], 100, budget()).is_err());
        assert!(IndexParams::new(vec![LedgerTable::Transaction], 100, budget()).is_err());
    }

    #[test]
    fn test_rejects_empty_tables_and_bad_sizes() {
        assert!(DeleteParams::new(vec![], 100, budget()).is_err());
        assert!(DeleteParams::new(vec![LedgerTable::Block], 0, budget()).is_err());
        assert!(DeleteParams::new(
            vec![LedgerTable::Block],
            defaults::BATCH_SIZE_MAX + 1,
            budget()
        )
        .is_err());
        assert!(DeleteParams::new(vec![LedgerTable::Block], 10, Duration::ZERO).is_err());
    }

    #[test]
    fn test_all_covers_phase_tables() {
        assert_eq!(RelinkParams::all().batch().tables(), DataPhase::Relink.tables());
        assert_eq!(IndexParams::all().batch().tables(), DataPhase::Index.tables());
        assert_eq!(DeleteParams::all().batch().batch_size(), defaults::BATCH_SIZE);
        let params = CopyParams::all_with(5, Duration::from_secs(1)).unwrap();
        assert_eq!(params.batch().batch_size(), 5);
    }

    #[test]
    fn test_finalize_params_reject_empty_hash() {
        assert!(FinalizeParams::from_bytes(Vec::new()).is_err());
        let params = FinalizeParams::from_bytes(b"000000000".to_vec()).unwrap();
        assert_eq!(params.shard_hash().as_bytes(), b"000000000");
    }

    #[test]
    fn test_command_operation_names() {
        assert_eq!(
            PhaseCommand::CreateSchema(ShardSchemaVersion::Init).operation(),
            "add_or_create_shard"
        );
        assert_eq!(
            PhaseCommand::Delete(DeleteParams::all()).operation(),
            "delete_copied_data"
        );
    }
}
