//! Storage boundary traits for the shard migration engine.
//!
//! The orchestrator only talks to storage through these traits. The
//! PostgreSQL implementations live in `strata-db`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{HeightRange, MigrateState, Shard, ShardId};
use crate::schema_version::ShardSchemaVersion;
use crate::tables::{DataPhase, LedgerTable};

// =============================================================================
// BATCH TYPES
// =============================================================================

/// Durable cursor for one table within one data phase of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    /// Highest batching key already processed.
    pub last_key: Option<i64>,
    /// Rows processed across all batches so far.
    pub rows_done: u64,
    /// No matching rows remain beyond `last_key`.
    pub completed: bool,
}

/// One table's share of a data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchJob {
    pub shard: ShardId,
    pub range: HeightRange,
    pub phase: DataPhase,
    pub table: LedgerTable,
}

/// Result of one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows selected by the batch.
    pub rows: u64,
    /// Cursor after the batch.
    pub last_key: Option<i64>,
    /// Fewer rows than the limit matched, so the table is done.
    pub completed: bool,
}

/// Where a row count is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLocation {
    Main,
    Shard(ShardId),
}

/// A shard row with its batching key, in canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedRow {
    pub key: i64,
    pub bytes: Vec<u8>,
}

// =============================================================================
// STORAGE TRAITS
// =============================================================================

/// Durable per-run migration state.
#[async_trait]
pub trait MigrationStateStore: Send + Sync {
    /// Insert a new run record in `Init`.
    ///
    /// Fails with `RunInProgress` while another run has not completed.
    async fn create_run(&self, shard: &Shard) -> Result<()>;

    /// The single run that has not reached `Completed`, if any.
    async fn unfinished_run(&self) -> Result<Option<Shard>>;

    /// Load a run record by id.
    async fn load_run(&self, id: ShardId) -> Result<Option<Shard>>;

    /// Compare-and-set the run state.
    ///
    /// Fails with `InvalidTransition` when the stored state is not `from`.
    /// A forward transition also updates `last_completed_state`.
    async fn transition(&self, id: ShardId, from: MigrateState, to: MigrateState) -> Result<Shard>;

    /// Record `Failed` with a reason, keeping `last_completed_state`.
    async fn mark_failed(&self, id: ShardId, reason: &str) -> Result<()>;

    /// Move a `Failed` run back to its last completed state.
    async fn restart_failed(&self, id: ShardId) -> Result<Shard>;

    /// Remove a run record.
    async fn delete_run(&self, id: ShardId) -> Result<()>;

    /// Exclusive upper bound of the most recent completed shard.
    async fn latest_completed_boundary(&self) -> Result<Option<i64>>;
}

/// Catalog of completed shards consulted by historical read paths.
#[async_trait]
pub trait ShardRegistry: Send + Sync {
    /// Finalize a run: store its hash and mark it `Completed`.
    ///
    /// The only write path. Requires the run to be in
    /// `DataRemovedFromMain`; completed entries are never rewritten.
    async fn register(&self, shard: &Shard) -> Result<Shard>;

    /// The completed shard whose range contains `height`, or `None` when
    /// that height still lives in the main store.
    async fn lookup(&self, height: i64) -> Result<Option<Shard>>;

    /// A completed shard by id.
    async fn get(&self, id: ShardId) -> Result<Option<Shard>>;

    /// Every completed shard, lowest range first.
    async fn list(&self) -> Result<Vec<Shard>>;
}

/// Shard store schema management.
#[async_trait]
pub trait ShardSchemaStore: Send + Sync {
    /// Schema version currently applied to the shard store, if it exists.
    async fn schema_version(&self, shard: ShardId) -> Result<Option<ShardSchemaVersion>>;

    /// Run the DDL for `version` and record it. Callers check ordering
    /// with [`crate::plan_schema_step`] first.
    async fn apply_schema(&self, shard: ShardId, version: ShardSchemaVersion) -> Result<()>;

    /// Drop the shard store entirely.
    async fn drop_shard_store(&self, shard: ShardId) -> Result<()>;
}

/// Batched row movement between the main store and shard stores.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Durable progress for one table of one phase.
    async fn load_progress(
        &self,
        shard: ShardId,
        phase: DataPhase,
        table: LedgerTable,
    ) -> Result<TableProgress>;

    /// Run one batch of at most `limit` rows past the stored cursor and
    /// advance the cursor in the same local transaction.
    async fn execute_batch(&self, job: &BatchJob, limit: u32) -> Result<BatchOutcome>;

    /// Rows of `table` within `range` at `location`.
    async fn count_in_range(
        &self,
        location: StoreLocation,
        table: LedgerTable,
        range: HeightRange,
    ) -> Result<u64>;

    /// Shard rows in key order after `after`, in canonical encoding.
    async fn fetch_shard_rows(
        &self,
        shard: ShardId,
        table: LedgerTable,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<KeyedRow>>;

    /// Whether the main store holds a block at `height`.
    async fn block_exists(&self, height: i64) -> Result<bool>;

    /// Forget every progress marker of a run.
    async fn clear_progress(&self, shard: ShardId) -> Result<()>;

    /// Remove every block and transaction index entry pointing at `shard`.
    /// Returns the number of entries removed.
    async fn clear_index_entries(&self, shard: ShardId) -> Result<u64>;
}
