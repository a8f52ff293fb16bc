//! Shard migration orchestrator.
//!
//! Drives one shard run through the fixed phase sequence:
//!
//! ```text
//! INIT → SHARD_SCHEMA_CREATED → SHARD_SCHEMA_FULL → DATA_COPIED_TO_SHARD
//!      → DATA_RELINKED_IN_MAIN → SECONDARY_INDEX_UPDATED
//!      → DATA_REMOVED_FROM_MAIN → COMPLETED
//! ```
//!
//! Every call takes the [`RunHandle`] of the attached run. A call made in
//! the wrong state is rejected with `InvalidTransition` and changes nothing.
//! Store failures inside a phase record `FAILED`; the run then stays inert
//! until an operator restarts or discards it.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use strata_core::{
    defaults, plan_schema_step, BatchStore, CopyParams, DataPhase, DeleteParams, Error,
    FinalizeParams, HeightRange, IndexParams, LedgerTable, MigrateState, MigrationStateStore,
    PhaseCommand, RelinkParams, Result, Shard, ShardHash, ShardHasher, ShardRegistry,
    ShardSchemaStore, ShardSchemaVersion, StoreLocation, TableBatchParams,
};
use strata_db::{
    Database, PgBatchRepository, PgMigrationStateRepository, PgShardRegistry,
    PgShardSchemaRepository,
};

use crate::batch_engine::{BatchEngine, EngineSettings, PhaseReport, StopReason};
use crate::config::MigrationConfig;
use crate::events::MigrationEvent;
use crate::lock::{ChainWriteGate, RunHandle, RunLock};

/// Result of one phase call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    /// Recorded state after the call.
    pub state: MigrateState,
    /// The call moved the run one step forward.
    pub advanced: bool,
    /// Batch progress for data phases; empty otherwise.
    pub report: PhaseReport,
}

impl PhaseOutcome {
    fn advanced_to(state: MigrateState) -> Self {
        Self {
            state,
            advanced: true,
            report: PhaseReport::default(),
        }
    }
}

/// Builder for [`MigrationOrchestrator`].
pub struct OrchestratorBuilder {
    runs: Arc<dyn MigrationStateStore>,
    registry: Arc<dyn ShardRegistry>,
    schemas: Arc<dyn ShardSchemaStore>,
    batches: Arc<dyn BatchStore>,
    config: MigrationConfig,
    gate: ChainWriteGate,
}

impl OrchestratorBuilder {
    pub fn new(
        runs: Arc<dyn MigrationStateStore>,
        registry: Arc<dyn ShardRegistry>,
        schemas: Arc<dyn ShardSchemaStore>,
        batches: Arc<dyn BatchStore>,
    ) -> Self {
        Self {
            runs,
            registry,
            schemas,
            batches,
            config: MigrationConfig::default(),
            gate: ChainWriteGate::new(),
        }
    }

    /// Use one value for every storage role.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: MigrationStateStore + ShardRegistry + ShardSchemaStore + BatchStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store.clone(), store)
    }

    /// PostgreSQL repositories over the database's pool.
    pub fn from_database(db: &Database) -> Self {
        let pool = db.pool.clone();
        Self::new(
            Arc::new(PgMigrationStateRepository::new(pool.clone())),
            Arc::new(PgShardRegistry::new(pool.clone())),
            Arc::new(PgShardSchemaRepository::new(pool.clone())),
            Arc::new(PgBatchRepository::new(pool)),
        )
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Share the gate that block acceptance uses.
    pub fn with_chain_write_gate(mut self, gate: ChainWriteGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn build(self) -> MigrationOrchestrator {
        let engine = BatchEngine::new(
            self.batches.clone(),
            EngineSettings {
                max_retries: self.config.batch_max_retries,
                retry_backoff: self.config.retry_backoff(),
                parallel_tables: self.config.parallel_tables,
            },
        );
        let (events, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);

        MigrationOrchestrator {
            runs: self.runs,
            registry: self.registry,
            schemas: self.schemas,
            batches: self.batches,
            engine,
            config: self.config,
            run_lock: RunLock::new(),
            gate: self.gate,
            events,
        }
    }
}

/// Coordinates shard runs over the storage traits.
pub struct MigrationOrchestrator {
    runs: Arc<dyn MigrationStateStore>,
    registry: Arc<dyn ShardRegistry>,
    schemas: Arc<dyn ShardSchemaStore>,
    batches: Arc<dyn BatchStore>,
    engine: BatchEngine,
    config: MigrationConfig,
    run_lock: RunLock,
    gate: ChainWriteGate,
    events: broadcast::Sender<MigrationEvent>,
}

impl MigrationOrchestrator {
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Gate to hand to block acceptance.
    pub fn chain_write_gate(&self) -> ChainWriteGate {
        self.gate.clone()
    }

    /// Read-side shard catalog.
    pub fn registry(&self) -> Arc<dyn ShardRegistry> {
        self.registry.clone()
    }

    /// Subscribe to run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // RUN LIFECYCLE
    // =========================================================================

    /// Create a run covering `[previous boundary, boundary)` and attach to it.
    ///
    /// The previous boundary is the upper bound of the latest completed
    /// shard, or 0 for the first shard.
    pub async fn begin_run(&self, boundary: i64) -> Result<RunHandle> {
        let guard = self.run_lock.try_acquire()?;

        if let Some(existing) = self.runs.unfinished_run().await? {
            return Err(Error::RunInProgress(format!(
                "shard {} is still {}",
                existing.id, existing.state
            )));
        }

        let from = self.runs.latest_completed_boundary().await?.unwrap_or(0);
        let range = HeightRange::new(from, boundary)?;
        let shard = Shard::new_run(range);
        self.runs.create_run(&shard).await?;

        info!(
            subsystem = "migrate",
            component = "orchestrator",
            op = "begin_run",
            shard_id = shard.id.value(),
            height_from = range.from,
            height_to = range.to,
            "Shard run started"
        );
        self.emit(MigrationEvent::RunStarted {
            shard_id: shard.id,
            height_range: range,
        });
        Ok(RunHandle::new(shard.id, range, guard))
    }

    /// Attach to the unfinished run left by an earlier process.
    pub async fn resume_run(&self) -> Result<RunHandle> {
        let guard = self.run_lock.try_acquire()?;
        let shard = self
            .runs
            .unfinished_run()
            .await?
            .ok_or_else(|| Error::NotInitialized("no unfinished shard run".to_string()))?;

        info!(
            subsystem = "migrate",
            component = "orchestrator",
            op = "resume_run",
            shard_id = shard.id.value(),
            state = shard.state.as_str(),
            "Attached to unfinished shard run"
        );
        Ok(RunHandle::new(shard.id, shard.height_range, guard))
    }

    /// Recorded state of the run. Pure read.
    pub async fn current_state(&self, run: &RunHandle) -> Result<MigrateState> {
        Ok(self.load(run).await?.state)
    }

    /// Full run record. Pure read.
    pub async fn run_record(&self, run: &RunHandle) -> Result<Shard> {
        self.load(run).await
    }

    // =========================================================================
    // PHASES
    // =========================================================================

    /// Bring the shard store to `version`.
    ///
    /// `Init` requires `INIT` and yields `SHARD_SCHEMA_CREATED`; `Full`
    /// requires `SHARD_SCHEMA_CREATED` and yields `SHARD_SCHEMA_FULL`. Schema
    /// failures leave the recorded state untouched.
    pub async fn add_or_create_shard(
        &self,
        run: &RunHandle,
        version: ShardSchemaVersion,
    ) -> Result<MigrateState> {
        const OPERATION: &str = "add_or_create_shard";
        let shard = self.load(run).await?;
        require(OPERATION, &shard, version.required_state())?;

        let current = self
            .schemas
            .schema_version(shard.id)
            .await
            .map_err(as_schema_error)?;
        if plan_schema_step(current, version)? {
            self.schemas
                .apply_schema(shard.id, version)
                .await
                .map_err(as_schema_error)?;
        } else {
            debug!(
                subsystem = "migrate",
                component = "orchestrator",
                op = OPERATION,
                shard_id = shard.id.value(),
                version = version.as_str(),
                "Shard schema already at requested version"
            );
        }

        match self
            .runs
            .transition(shard.id, shard.state, version.target_state())
            .await
        {
            Ok(updated) => {
                self.announce(OPERATION, &updated);
                Ok(updated.state)
            }
            Err(e) => Err(self.fail(&shard, OPERATION, e).await),
        }
    }

    /// Copy the selected main rows of every listed table into the shard.
    pub async fn copy_data_to_shard(
        &self,
        run: &RunHandle,
        params: &CopyParams,
    ) -> Result<PhaseOutcome> {
        self.run_data_phase(run, CopyParams::PHASE, params.batch())
            .await
    }

    /// Point retained derived rows below the boundary at the snapshot block.
    pub async fn relink_data_to_snapshot_block(
        &self,
        run: &RunHandle,
        params: &RelinkParams,
    ) -> Result<PhaseOutcome> {
        self.run_data_phase(run, RelinkParams::PHASE, params.batch())
            .await
    }

    /// Record the shard location of every copied block and transaction.
    pub async fn update_secondary_index(
        &self,
        run: &RunHandle,
        params: &IndexParams,
    ) -> Result<PhaseOutcome> {
        self.run_data_phase(run, IndexParams::PHASE, params.batch())
            .await
    }

    /// Remove from the main store the rows the shard durably holds.
    pub async fn delete_copied_data(
        &self,
        run: &RunHandle,
        params: &DeleteParams,
    ) -> Result<PhaseOutcome> {
        self.run_data_phase(run, DeleteParams::PHASE, params.batch())
            .await
    }

    /// Register the shard with its content hash and complete the run.
    pub async fn add_shard_info(
        &self,
        run: &RunHandle,
        params: &FinalizeParams,
    ) -> Result<MigrateState> {
        const OPERATION: &str = "add_shard_info";
        let mut shard = self.load(run).await?;
        require(OPERATION, &shard, MigrateState::DataRemovedFromMain)?;

        if self.config.verify_content_hash {
            let computed = match self.hash_shard(&shard).await {
                Ok(hash) => hash,
                Err(e) => return Err(self.fail(&shard, OPERATION, e).await),
            };
            if &computed != params.shard_hash() {
                warn!(
                    subsystem = "migrate",
                    component = "orchestrator",
                    op = OPERATION,
                    shard_id = shard.id.value(),
                    expected = %params.shard_hash(),
                    actual = %computed,
                    "Rejected shard hash"
                );
                return Err(Error::HashMismatch {
                    expected: params.shard_hash().to_hex(),
                    actual: computed.to_hex(),
                });
            }
        }

        shard.shard_hash = Some(params.shard_hash().clone());
        let registered = match self.registry.register(&shard).await {
            Ok(registered) => registered,
            Err(e) => return Err(self.fail(&shard, OPERATION, e).await),
        };

        self.announce(OPERATION, &registered);
        self.emit(MigrationEvent::RunCompleted {
            shard_id: registered.id,
        });
        Ok(registered.state)
    }

    /// Dispatch one phase call.
    pub async fn execute(&self, run: &RunHandle, command: PhaseCommand) -> Result<PhaseOutcome> {
        match command {
            PhaseCommand::CreateSchema(version) => self
                .add_or_create_shard(run, version)
                .await
                .map(PhaseOutcome::advanced_to),
            PhaseCommand::Copy(params) => self.copy_data_to_shard(run, &params).await,
            PhaseCommand::Relink(params) => self.relink_data_to_snapshot_block(run, &params).await,
            PhaseCommand::UpdateIndex(params) => self.update_secondary_index(run, &params).await,
            PhaseCommand::Delete(params) => self.delete_copied_data(run, &params).await,
            PhaseCommand::Finalize(params) => self
                .add_shard_info(run, &params)
                .await
                .map(PhaseOutcome::advanced_to),
        }
    }

    /// The phase call that follows the recorded state, with parameters
    /// covering every table from the configuration.
    ///
    /// Finalization uses the computed content hash.
    pub async fn next_command(&self, run: &RunHandle) -> Result<Option<PhaseCommand>> {
        let shard = self.load(run).await?;
        let command = match shard.state {
            MigrateState::Init => PhaseCommand::CreateSchema(ShardSchemaVersion::Init),
            MigrateState::ShardSchemaCreated => PhaseCommand::CreateSchema(ShardSchemaVersion::Full),
            MigrateState::ShardSchemaFull => PhaseCommand::Copy(self.config.copy_params()?),
            MigrateState::DataCopiedToShard => PhaseCommand::Relink(self.config.relink_params()?),
            MigrateState::DataRelinkedInMain => {
                PhaseCommand::UpdateIndex(self.config.index_params()?)
            }
            MigrateState::SecondaryIndexUpdated => {
                PhaseCommand::Delete(self.config.delete_params()?)
            }
            MigrateState::DataRemovedFromMain => {
                PhaseCommand::Finalize(FinalizeParams::new(self.hash_shard(&shard).await?))
            }
            MigrateState::Completed => return Ok(None),
            MigrateState::Failed => {
                return Err(Error::InvalidTransition {
                    operation: "next_command",
                    current: MigrateState::Failed,
                    required: shard.last_completed_state,
                })
            }
        };
        Ok(Some(command))
    }

    /// Run phases in order until the run completes or is cancelled,
    /// repeating calls that ran out of budget.
    pub async fn run_to_completion(&self, run: &RunHandle) -> Result<MigrateState> {
        while let Some(command) = self.next_command(run).await? {
            let operation = command.operation();
            let outcome = self.execute(run, command).await?;
            if outcome.report.stopped == Some(StopReason::Cancelled) {
                info!(
                    subsystem = "migrate",
                    component = "orchestrator",
                    op = operation,
                    shard_id = run.shard_id().value(),
                    state = outcome.state.as_str(),
                    "Shard run cancelled"
                );
                return Ok(outcome.state);
            }
        }
        self.current_state(run).await
    }

    // =========================================================================
    // HASHING AND OPERATOR ACTIONS
    // =========================================================================

    /// SHA-256 over the shard's copied tables in key order.
    ///
    /// Available once the copy phase has completed.
    pub async fn compute_shard_hash(&self, run: &RunHandle) -> Result<ShardHash> {
        let shard = self.load(run).await?;
        let copied = MigrateState::DataCopiedToShard.ordinal();
        if shard.resume_state().ordinal() < copied {
            return Err(Error::InvalidTransition {
                operation: "compute_shard_hash",
                current: shard.state,
                required: MigrateState::DataCopiedToShard,
            });
        }
        self.hash_shard(&shard).await
    }

    /// Move a `FAILED` run back to the last state a phase completed.
    pub async fn restart_failed(&self, run: &RunHandle) -> Result<MigrateState> {
        let shard = self.runs.restart_failed(run.shard_id()).await?;
        self.announce("restart_failed", &shard);
        Ok(shard.state)
    }

    /// Drop the shard store, its index entries, its progress markers and the
    /// run record.
    ///
    /// Refused once main-store deletion has begun, since the shard may then
    /// hold the only copy of some rows. Rows already relinked to the snapshot
    /// block stay attached to it; the snapshot block itself never leaves the
    /// main store.
    pub async fn discard_run(&self, run: RunHandle) -> Result<()> {
        let shard = self.load(&run).await?;

        let mut deletion_started = shard.state.main_data_removed()
            || shard.last_completed_state.main_data_removed()
            || (shard.state == MigrateState::Failed
                && shard.last_completed_state == MigrateState::SecondaryIndexUpdated);
        for &table in DataPhase::Delete.tables() {
            let progress = self
                .batches
                .load_progress(shard.id, DataPhase::Delete, table)
                .await?;
            deletion_started |= progress.rows_done > 0;
        }
        if deletion_started {
            return Err(Error::InvalidInput(format!(
                "shard {} has already removed rows from the main store; restart and finish it instead",
                shard.id
            )));
        }

        let index_entries = self.batches.clear_index_entries(shard.id).await?;
        self.schemas.drop_shard_store(shard.id).await?;
        self.batches.clear_progress(shard.id).await?;
        self.runs.delete_run(shard.id).await?;

        warn!(
            subsystem = "migrate",
            component = "orchestrator",
            op = "discard_run",
            shard_id = shard.id.value(),
            state = shard.state.as_str(),
            index_entries,
            "Shard run discarded"
        );
        self.emit(MigrationEvent::RunDiscarded { shard_id: shard.id });
        Ok(())
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn load(&self, run: &RunHandle) -> Result<Shard> {
        self.runs.load_run(run.shard_id()).await?.ok_or_else(|| {
            Error::NotInitialized(format!("shard run {} no longer exists", run.shard_id()))
        })
    }

    async fn run_data_phase(
        &self,
        run: &RunHandle,
        phase: DataPhase,
        params: &TableBatchParams,
    ) -> Result<PhaseOutcome> {
        let shard = self.load(run).await?;
        require(phase.operation(), &shard, phase.required_state())?;

        match self.drive_data_phase(run, &shard, phase, params).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.fail(&shard, phase.operation(), e).await),
        }
    }

    async fn drive_data_phase(
        &self,
        run: &RunHandle,
        shard: &Shard,
        phase: DataPhase,
        params: &TableBatchParams,
    ) -> Result<PhaseOutcome> {
        let start = Instant::now();
        self.check_prerequisites(shard, phase, params).await?;

        if phase == DataPhase::Relink
            && !self.batches.block_exists(shard.snapshot_height()).await?
        {
            return Err(Error::Relink(format!(
                "snapshot block at height {} is missing from the main store",
                shard.snapshot_height()
            )));
        }

        let report = {
            let _permit = if phase.touches_chain_tables() {
                Some(self.gate.exclusive().await)
            } else {
                None
            };
            self.engine
                .run_phase(shard, phase, params, &run.cancel_handle())
                .await?
        };

        if !report.is_complete() {
            warn!(
                subsystem = "migrate",
                component = "orchestrator",
                op = phase.operation(),
                shard_id = shard.id.value(),
                rows = report.rows,
                batches = report.batches,
                pending = report.pending_tables.len(),
                stopped = ?report.stopped,
                duration_ms = start.elapsed().as_millis() as u64,
                "Phase returned with partial progress"
            );
            self.emit(MigrationEvent::PhasePartial {
                shard_id: shard.id,
                phase,
                rows: report.rows,
                stopped: report.stopped,
            });
            return Ok(self.unchanged(shard, report));
        }

        // tables outside this call must be finished by earlier calls
        for &table in phase.tables() {
            if params.tables().contains(&table) {
                continue;
            }
            let progress = self
                .batches
                .load_progress(shard.id, phase, table)
                .await
                .map_err(|e| phase.failure(table, &e))?;
            if !progress.completed {
                info!(
                    subsystem = "migrate",
                    component = "orchestrator",
                    op = phase.operation(),
                    shard_id = shard.id.value(),
                    table = table.name(),
                    "Requested tables done, phase waits for remaining tables"
                );
                return Ok(self.unchanged(shard, report));
            }
        }

        self.verify_phase(shard, phase).await?;

        let updated = self
            .runs
            .transition(shard.id, phase.required_state(), phase.target_state())
            .await?;

        info!(
            subsystem = "migrate",
            component = "orchestrator",
            op = phase.operation(),
            shard_id = shard.id.value(),
            phase = phase.as_str(),
            rows = report.rows,
            batches = report.batches,
            duration_ms = start.elapsed().as_millis() as u64,
            "Phase completed"
        );
        self.announce(phase.operation(), &updated);

        Ok(PhaseOutcome {
            state: updated.state,
            advanced: true,
            report,
        })
    }

    fn unchanged(&self, shard: &Shard, report: PhaseReport) -> PhaseOutcome {
        PhaseOutcome {
            state: shard.state,
            advanced: false,
            report,
        }
    }

    /// A table with an in-phase prerequisite may only run once that
    /// prerequisite is finished or is part of the same call.
    async fn check_prerequisites(
        &self,
        shard: &Shard,
        phase: DataPhase,
        params: &TableBatchParams,
    ) -> Result<()> {
        for &table in params.tables() {
            let Some(prerequisite) = phase.prerequisite(table) else {
                continue;
            };
            if params.tables().contains(&prerequisite) {
                continue;
            }
            let progress = self
                .batches
                .load_progress(shard.id, phase, prerequisite)
                .await?;
            if !progress.completed {
                return Err(Error::InvalidInput(format!(
                    "{} of table {} requires table {} to be finished first",
                    phase, table, prerequisite
                )));
            }
        }
        Ok(())
    }

    /// Post-conditions checked before a data phase may advance the state.
    async fn verify_phase(&self, shard: &Shard, phase: DataPhase) -> Result<()> {
        let range = shard.height_range;
        match phase {
            DataPhase::Copy => {
                for &table in phase.tables() {
                    let main = self.count(StoreLocation::Main, table, range, phase).await?;
                    let sharded = self
                        .count(StoreLocation::Shard(shard.id), table, range, phase)
                        .await?;
                    if main != sharded {
                        return Err(Error::Copy {
                            table: table.name().to_string(),
                            message: format!(
                                "main store holds {} rows in {}, shard holds {}",
                                main, range, sharded
                            ),
                        });
                    }
                }
            }
            DataPhase::Relink => {
                let below = HeightRange::new(0, shard.snapshot_height())?;
                for &table in phase.tables() {
                    let stale = self.count(StoreLocation::Main, table, below, phase).await?;
                    if stale > 0 {
                        return Err(Error::Relink(format!(
                            "{} rows of {} still reference blocks below height {}",
                            stale,
                            table,
                            shard.snapshot_height()
                        )));
                    }
                }
            }
            DataPhase::Index => {
                for &table in phase.tables() {
                    let Some(source) = table.index_source() else {
                        continue;
                    };
                    let indexed = self.count(StoreLocation::Main, table, range, phase).await?;
                    let sharded = self
                        .count(StoreLocation::Shard(shard.id), source, range, phase)
                        .await?;
                    if indexed < sharded {
                        return Err(Error::Index(format!(
                            "{} covers {} of {} sharded {} rows",
                            table, indexed, sharded, source
                        )));
                    }
                }
            }
            DataPhase::Delete => {
                for &table in phase.tables() {
                    let left = self.count(StoreLocation::Main, table, range, phase).await?;
                    if left > 0 {
                        return Err(Error::Delete(format!(
                            "{} rows of {} remain in the main store within {}",
                            left, table, range
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn count(
        &self,
        location: StoreLocation,
        table: LedgerTable,
        range: HeightRange,
        phase: DataPhase,
    ) -> Result<u64> {
        self.batches
            .count_in_range(location, table, range)
            .await
            .map_err(|e| phase.failure(table, &e))
    }

    async fn hash_shard(&self, shard: &Shard) -> Result<ShardHash> {
        let fetch = self.config.hash_fetch_size.max(1);
        let mut hasher = ShardHasher::new();

        for &table in DataPhase::Copy.tables() {
            hasher.begin_table(table);
            let mut after = None;
            loop {
                let rows = self
                    .batches
                    .fetch_shard_rows(shard.id, table, after, fetch)
                    .await?;
                for row in &rows {
                    trace!(
                        subsystem = "migrate",
                        component = "orchestrator",
                        op = "hash_row",
                        shard_id = shard.id.value(),
                        table = table.name(),
                        key = row.key,
                        "Hashing shard row"
                    );
                    hasher.update_row(&row.bytes);
                }
                after = rows.last().map(|r| r.key).or(after);
                if rows.len() < fetch as usize {
                    break;
                }
            }
        }

        debug!(
            subsystem = "migrate",
            component = "orchestrator",
            op = "compute_shard_hash",
            shard_id = shard.id.value(),
            rows = hasher.rows(),
            "Hashed shard content"
        );
        Ok(hasher.finish())
    }

    /// Record `FAILED` for errors that are not plain rejections.
    async fn fail(&self, shard: &Shard, operation: &'static str, err: Error) -> Error {
        if err.leaves_state_unchanged() {
            return err;
        }
        let reason = format!("{}: {}", operation, err);
        error!(
            subsystem = "migrate",
            component = "orchestrator",
            op = operation,
            shard_id = shard.id.value(),
            last_completed_state = shard.state.as_str(),
            error = %err,
            "Phase failed, run marked FAILED"
        );
        if let Err(mark_err) = self.runs.mark_failed(shard.id, &reason).await {
            error!(
                subsystem = "migrate",
                component = "orchestrator",
                op = operation,
                shard_id = shard.id.value(),
                error = %mark_err,
                "Could not record FAILED state"
            );
        }
        self.emit(MigrationEvent::RunFailed {
            shard_id: shard.id,
            operation,
            error: err.to_string(),
        });
        err
    }

    fn announce(&self, operation: &'static str, shard: &Shard) {
        info!(
            subsystem = "migrate",
            component = "orchestrator",
            op = operation,
            shard_id = shard.id.value(),
            state = shard.state.as_str(),
            "Shard run state changed"
        );
        self.emit(MigrationEvent::StateChanged {
            shard_id: shard.id,
            state: shard.state,
        });
    }

    fn emit(&self, event: MigrationEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn require(operation: &'static str, shard: &Shard, required: MigrateState) -> Result<()> {
    if shard.state == required {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            operation,
            current: shard.state,
            required,
        })
    }
}

fn as_schema_error(err: Error) -> Error {
    match err {
        Error::Schema(_) => err,
        other => Error::Schema(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_matches_exact_state() {
        let mut shard = Shard::new_run(HeightRange::new(0, 10).unwrap());
        assert!(require("op", &shard, MigrateState::Init).is_ok());
        shard.state = MigrateState::ShardSchemaFull;
        let err = require("copy_data_to_shard", &shard, MigrateState::Init).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                operation: "copy_data_to_shard",
                current: MigrateState::ShardSchemaFull,
                required: MigrateState::Init,
            }
        ));
    }

    #[test]
    fn test_store_errors_become_schema_errors() {
        let err = as_schema_error(Error::Internal("disk".to_string()));
        assert!(matches!(err, Error::Schema(ref m) if m.contains("disk")));
        assert!(err.leaves_state_unchanged());
    }
}
