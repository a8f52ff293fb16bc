//! In-memory ledger store for orchestrator tests.
//!
//! Implements every storage trait over a single mutex-guarded state with
//! the same row semantics as the PostgreSQL repositories: one batch is
//! applied atomically with its progress marker, copies skip rows already
//! present, shard transactions need their shard block, and deletes only
//! remove rows the shard holds. Faults can be injected per phase and table.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use strata_migrate::{
    BatchJob, BatchOutcome, BatchStore, DataPhase, Error, HeightRange, KeyedRow, LedgerTable,
    MigrateState, MigrationConfig, MigrationOrchestrator, MigrationStateStore, OrchestratorBuilder,
    Result, Shard, ShardId, ShardRegistry, ShardSchemaStore, ShardSchemaVersion, StoreLocation,
    TableProgress,
};

/// Derived tables seeded by [`MemoryLedger::seed_chain`].
pub const DERIVED: [LedgerTable; 5] = [
    LedgerTable::GenesisPublicKey,
    LedgerTable::PublicKey,
    LedgerTable::ShufflingData,
    LedgerTable::DataTag,
    LedgerTable::PrunableMessage,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub height: i64,
    pub payload: String,
}

type Table = BTreeMap<i64, Row>;

#[derive(Default)]
struct LedgerState {
    runs: BTreeMap<ShardId, Shard>,
    schemas: HashMap<ShardId, ShardSchemaVersion>,
    main: HashMap<LedgerTable, Table>,
    shards: HashMap<(ShardId, LedgerTable), Table>,
    progress: HashMap<(ShardId, DataPhase, LedgerTable), TableProgress>,
    next_key: i64,
}

#[derive(Default)]
struct Faults {
    transient: HashMap<(DataPhase, LedgerTable), u32>,
    permanent: HashSet<(DataPhase, LedgerTable)>,
    fail_after: HashMap<(DataPhase, LedgerTable), u32>,
    schema: bool,
    batch_delay: Option<Duration>,
}

/// Shared in-memory store.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    faults: Mutex<Faults>,
    batch_calls: Mutex<HashMap<(DataPhase, LedgerTable), u32>>,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---------------------------------------------------------------------
    // seeding and inspection
    // ---------------------------------------------------------------------

    fn insert_main(state: &mut LedgerState, table: LedgerTable, height: i64, payload: String) {
        state.next_key += 1;
        let key = state.next_key;
        state
            .main
            .entry(table)
            .or_default()
            .insert(key, Row { height, payload });
    }

    /// Blocks `from..to` with `txs_per_block` transactions each, plus one
    /// row per block in every derived table.
    pub fn seed_chain(&self, from: i64, to: i64, txs_per_block: i64) {
        let mut state = self.state.lock().unwrap();
        for height in from..to {
            Self::insert_main(&mut state, LedgerTable::Block, height, format!("block-{height}"));
            for n in 0..txs_per_block {
                Self::insert_main(
                    &mut state,
                    LedgerTable::Transaction,
                    height,
                    format!("tx-{height}-{n}"),
                );
            }
            for table in DERIVED {
                Self::insert_main(&mut state, table, height, format!("{table}-{height}"));
            }
        }
    }

    /// Main rows of `table`.
    pub fn main_rows(&self, table: LedgerTable) -> Vec<Row> {
        let state = self.state.lock().unwrap();
        state
            .main
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Main rows of `table` with heights in `[from, to)`.
    pub fn main_count(&self, table: LedgerTable, from: i64, to: i64) -> usize {
        self.main_rows(table)
            .iter()
            .filter(|r| r.height >= from && r.height < to)
            .count()
    }

    /// Rows of `table` in a shard store, key order.
    pub fn shard_rows(&self, shard: ShardId, table: LedgerTable) -> Vec<(i64, Row)> {
        let state = self.state.lock().unwrap();
        state
            .shards
            .get(&(shard, table))
            .map(|t| t.iter().map(|(k, r)| (*k, r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn has_shard_store(&self, shard: ShardId) -> bool {
        self.state.lock().unwrap().schemas.contains_key(&shard)
    }

    /// Block and transaction index entries pointing at `shard`.
    pub fn index_entries(&self, shard: ShardId) -> usize {
        let state = self.state.lock().unwrap();
        let tag = index_tag(shard);
        DataPhase::Index
            .tables()
            .iter()
            .filter_map(|table| state.main.get(table))
            .map(|t| t.values().filter(|r| r.payload == tag).count())
            .sum()
    }

    pub fn progress_rows(&self, shard: ShardId) -> usize {
        let state = self.state.lock().unwrap();
        state.progress.keys().filter(|(s, _, _)| *s == shard).count()
    }

    /// Overwrite a shard row's payload to simulate tampering.
    pub fn tamper_shard_row(&self, shard: ShardId, table: LedgerTable) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state
            .shards
            .get_mut(&(shard, table))
            .and_then(|t| t.values_mut().next())
        {
            row.payload.push_str("-tampered");
        }
    }

    /// Batches executed so far for one phase and table.
    pub fn batch_calls(&self, phase: DataPhase, table: LedgerTable) -> u32 {
        self.batch_calls
            .lock()
            .unwrap()
            .get(&(phase, table))
            .copied()
            .unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // fault injection
    // ---------------------------------------------------------------------

    /// Fail the next `times` batches with a retryable store error.
    pub fn fail_transiently(&self, phase: DataPhase, table: LedgerTable, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .transient
            .insert((phase, table), times);
    }

    /// Fail every batch with a non-retryable store error.
    pub fn fail_permanently(&self, phase: DataPhase, table: LedgerTable) {
        self.faults.lock().unwrap().permanent.insert((phase, table));
    }

    /// Let `batches` batches succeed, then fail permanently.
    pub fn fail_after(&self, phase: DataPhase, table: LedgerTable, batches: u32) {
        self.faults
            .lock()
            .unwrap()
            .fail_after
            .insert((phase, table), batches);
    }

    pub fn heal(&self) {
        let mut faults = self.faults.lock().unwrap();
        faults.transient.clear();
        faults.permanent.clear();
        faults.fail_after.clear();
        faults.schema = false;
    }

    pub fn fail_schema(&self, fail: bool) {
        self.faults.lock().unwrap().schema = fail;
    }

    /// Sleep this long inside every batch.
    pub fn set_batch_delay(&self, delay: Duration) {
        self.faults.lock().unwrap().batch_delay = Some(delay);
    }

    fn injected_fault(&self, phase: DataPhase, table: LedgerTable) -> Option<Error> {
        let mut faults = self.faults.lock().unwrap();
        if faults.permanent.contains(&(phase, table)) {
            return Some(Error::Internal(format!("injected failure on {table}")));
        }
        if let Some(left) = faults.fail_after.get_mut(&(phase, table)) {
            if *left == 0 {
                return Some(Error::Internal(format!("injected failure on {table}")));
            }
            *left -= 1;
        }
        if let Some(left) = faults.transient.get_mut(&(phase, table)) {
            if *left > 0 {
                *left -= 1;
                return Some(Error::Database(sqlx::Error::PoolTimedOut));
            }
        }
        None
    }

    fn rejected(state: &LedgerState, id: ShardId, operation: &'static str, required: MigrateState) -> Error {
        match state.runs.get(&id) {
            Some(shard) => Error::InvalidTransition {
                operation,
                current: shard.state,
                required,
            },
            None => Error::NotInitialized(format!("no shard run {id}")),
        }
    }

    fn apply_batch(state: &mut LedgerState, job: &BatchJob, limit: u32) -> Result<BatchOutcome> {
        let key = (job.shard, job.phase, job.table);
        let progress = state.progress.get(&key).copied().unwrap_or_default();
        if progress.completed {
            return Ok(BatchOutcome {
                rows: 0,
                last_key: progress.last_key,
                completed: true,
            });
        }
        let cursor = progress.last_key.unwrap_or(0);
        let limit_rows = limit as usize;
        let range = job.range;
        let shard_ready = state.schemas.get(&job.shard) == Some(&ShardSchemaVersion::Full);

        let selected: Vec<(i64, Row)> = match job.phase {
            DataPhase::Copy | DataPhase::Relink | DataPhase::Delete => {
                let empty = Table::new();
                let main = state.main.get(&job.table).unwrap_or(&empty);
                let shard = state.shards.get(&(job.shard, job.table));
                main.range(cursor + 1..)
                    .filter(|(k, r)| match job.phase {
                        DataPhase::Relink => r.height < range.to,
                        DataPhase::Delete => {
                            range.contains(r.height)
                                && shard.map_or(false, |s| s.contains_key(*k))
                        }
                        _ => range.contains(r.height),
                    })
                    .take(limit_rows)
                    .map(|(k, r)| (*k, r.clone()))
                    .collect()
            }
            DataPhase::Index => {
                let source = job
                    .table
                    .index_source()
                    .ok_or_else(|| Error::InvalidInput(format!("{} is not an index", job.table)))?;
                state
                    .shards
                    .get(&(job.shard, source))
                    .map(|s| {
                        s.range(cursor + 1..)
                            .take(limit_rows)
                            .map(|(k, r)| (*k, r.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };

        match job.phase {
            DataPhase::Copy => {
                if !shard_ready {
                    return Err(Error::Internal(format!("shard store {} is missing", job.shard)));
                }
                if job.table == LedgerTable::Transaction {
                    let blocks = state.shards.get(&(job.shard, LedgerTable::Block));
                    for (_, row) in &selected {
                        let parent = blocks.map_or(false, |b| b.values().any(|bl| bl.height == row.height));
                        if !parent {
                            return Err(Error::Internal(format!(
                                "foreign key violation: no shard block at height {}",
                                row.height
                            )));
                        }
                    }
                }
                let target = state.shards.entry((job.shard, job.table)).or_default();
                for (k, row) in &selected {
                    target.entry(*k).or_insert_with(|| row.clone());
                }
            }
            DataPhase::Relink => {
                let snapshot = range.to;
                let main = state.main.entry(job.table).or_default();
                for (k, _) in &selected {
                    if let Some(row) = main.get_mut(k) {
                        row.height = snapshot;
                    }
                }
            }
            DataPhase::Index => {
                let index = state.main.entry(job.table).or_default();
                for (k, row) in &selected {
                    index.insert(
                        *k,
                        Row {
                            height: row.height,
                            payload: index_tag(job.shard),
                        },
                    );
                }
            }
            DataPhase::Delete => {
                let main = state.main.entry(job.table).or_default();
                for (k, _) in &selected {
                    main.remove(k);
                }
            }
        }

        let rows = selected.len() as u64;
        let outcome = BatchOutcome {
            rows,
            last_key: selected.last().map(|(k, _)| *k).or(progress.last_key),
            completed: rows < u64::from(limit),
        };
        state.progress.insert(
            key,
            TableProgress {
                last_key: outcome.last_key,
                rows_done: progress.rows_done + rows,
                completed: outcome.completed,
            },
        );
        Ok(outcome)
    }
}

#[async_trait]
impl MigrationStateStore for MemoryLedger {
    async fn create_run(&self, shard: &Shard) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.runs.values().any(|r| !r.is_completed()) {
            return Err(Error::RunInProgress("another shard run has not completed".into()));
        }
        if state.runs.contains_key(&shard.id) {
            return Err(Error::InvalidInput(format!("shard {} already exists", shard.id)));
        }
        state.runs.insert(shard.id, shard.clone());
        Ok(())
    }

    async fn unfinished_run(&self) -> Result<Option<Shard>> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.values().find(|r| !r.is_completed()).cloned())
    }

    async fn load_run(&self, id: ShardId) -> Result<Option<Shard>> {
        Ok(self.state.lock().unwrap().runs.get(&id).cloned())
    }

    async fn transition(&self, id: ShardId, from: MigrateState, to: MigrateState) -> Result<Shard> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidInput(format!("{from} cannot move to {to}")));
        }
        let mut state = self.state.lock().unwrap();
        if state.runs.get(&id).map(|s| s.state) != Some(from) {
            return Err(Self::rejected(&state, id, "transition", from));
        }
        let shard = state.runs.get_mut(&id).unwrap();
        shard.state = to;
        if from.next() == Some(to) {
            shard.last_completed_state = to;
        }
        shard.failure_reason = None;
        Ok(shard.clone())
    }

    async fn mark_failed(&self, id: ShardId, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(shard) = state.runs.get_mut(&id) {
            if !shard.state.is_terminal() {
                shard.state = MigrateState::Failed;
                shard.failure_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn restart_failed(&self, id: ShardId) -> Result<Shard> {
        let mut state = self.state.lock().unwrap();
        if state.runs.get(&id).map(|s| s.state) != Some(MigrateState::Failed) {
            return Err(Self::rejected(&state, id, "restart_failed", MigrateState::Failed));
        }
        let shard = state.runs.get_mut(&id).unwrap();
        shard.state = shard.last_completed_state;
        shard.failure_reason = None;
        Ok(shard.clone())
    }

    async fn delete_run(&self, id: ShardId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.runs.get(&id) {
            Some(shard) if !shard.is_completed() => {
                state.runs.remove(&id);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("unfinished shard run {id}"))),
        }
    }

    async fn latest_completed_boundary(&self) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .filter(|r| r.is_completed())
            .map(|r| r.height_range.to)
            .max())
    }
}

#[async_trait]
impl ShardRegistry for MemoryLedger {
    async fn register(&self, shard: &Shard) -> Result<Shard> {
        let hash = shard
            .shard_hash
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("shard {} has no content hash", shard.id)))?;
        let mut state = self.state.lock().unwrap();
        if state.runs.get(&shard.id).map(|s| s.state) != Some(MigrateState::DataRemovedFromMain) {
            return Err(Self::rejected(
                &state,
                shard.id,
                "add_shard_info",
                MigrateState::DataRemovedFromMain,
            ));
        }
        let stored = state.runs.get_mut(&shard.id).unwrap();
        stored.shard_hash = Some(hash);
        stored.state = MigrateState::Completed;
        stored.last_completed_state = MigrateState::Completed;
        Ok(stored.clone())
    }

    async fn lookup(&self, height: i64) -> Result<Option<Shard>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .find(|r| r.is_completed() && r.height_range.contains(height))
            .cloned())
    }

    async fn get(&self, id: ShardId) -> Result<Option<Shard>> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.get(&id).filter(|r| r.is_completed()).cloned())
    }

    async fn list(&self) -> Result<Vec<Shard>> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.values().filter(|r| r.is_completed()).cloned().collect())
    }
}

#[async_trait]
impl ShardSchemaStore for MemoryLedger {
    async fn schema_version(&self, shard: ShardId) -> Result<Option<ShardSchemaVersion>> {
        if self.faults.lock().unwrap().schema {
            return Err(Error::Internal("schema store unavailable".into()));
        }
        Ok(self.state.lock().unwrap().schemas.get(&shard).copied())
    }

    async fn apply_schema(&self, shard: ShardId, version: ShardSchemaVersion) -> Result<()> {
        if self.faults.lock().unwrap().schema {
            return Err(Error::Internal("schema store unavailable".into()));
        }
        self.state.lock().unwrap().schemas.insert(shard, version);
        Ok(())
    }

    async fn drop_shard_store(&self, shard: ShardId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.schemas.remove(&shard);
        state.shards.retain(|(id, _), _| *id != shard);
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryLedger {
    async fn load_progress(
        &self,
        shard: ShardId,
        phase: DataPhase,
        table: LedgerTable,
    ) -> Result<TableProgress> {
        let state = self.state.lock().unwrap();
        Ok(state
            .progress
            .get(&(shard, phase, table))
            .copied()
            .unwrap_or_default())
    }

    async fn execute_batch(&self, job: &BatchJob, limit: u32) -> Result<BatchOutcome> {
        let delay = self.faults.lock().unwrap().batch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self
            .batch_calls
            .lock()
            .unwrap()
            .entry((job.phase, job.table))
            .or_default() += 1;
        if let Some(err) = self.injected_fault(job.phase, job.table) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        Self::apply_batch(&mut state, job, limit)
    }

    async fn count_in_range(
        &self,
        location: StoreLocation,
        table: LedgerTable,
        range: HeightRange,
    ) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let rows = match location {
            StoreLocation::Main => state.main.get(&table),
            StoreLocation::Shard(shard) => state.shards.get(&(shard, table)),
        };
        Ok(rows
            .map(|t| t.values().filter(|r| range.contains(r.height)).count() as u64)
            .unwrap_or(0))
    }

    async fn fetch_shard_rows(
        &self,
        shard: ShardId,
        table: LedgerTable,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<KeyedRow>> {
        let state = self.state.lock().unwrap();
        let start = after.unwrap_or(0) + 1;
        Ok(state
            .shards
            .get(&(shard, table))
            .map(|t| {
                t.range(start..)
                    .take(limit as usize)
                    .map(|(k, r)| KeyedRow {
                        key: *k,
                        bytes: format!("{}|{}|{}", k, r.height, r.payload).into_bytes(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn block_exists(&self, height: i64) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .main
            .get(&LedgerTable::Block)
            .map_or(false, |t| t.values().any(|r| r.height == height)))
    }

    async fn clear_progress(&self, shard: ShardId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.progress.retain(|(id, _, _), _| *id != shard);
        Ok(())
    }

    async fn clear_index_entries(&self, shard: ShardId) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let tag = index_tag(shard);
        let mut removed = 0;
        for table in DataPhase::Index.tables() {
            if let Some(index) = state.main.get_mut(table) {
                let before = index.len();
                index.retain(|_, r| r.payload != tag);
                removed += (before - index.len()) as u64;
            }
        }
        Ok(removed)
    }
}

fn index_tag(shard: ShardId) -> String {
    format!("shard:{}", shard)
}

/// Config with small batches so phases take several batches.
pub fn test_config() -> MigrationConfig {
    MigrationConfig::default()
        .with_batch_size(4)
        .with_time_budget(Duration::from_secs(30))
        .with_retries(3, 10)
}

pub fn orchestrator(ledger: &Arc<MemoryLedger>, config: MigrationConfig) -> MigrationOrchestrator {
    OrchestratorBuilder::from_store(ledger.clone())
        .with_config(config)
        .build()
}
