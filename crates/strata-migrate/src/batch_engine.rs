//! Batch driver loop shared by the copy, relink, index and delete phases.
//!
//! The engine repeatedly asks the [`BatchStore`] for the next batch of a
//! table until the table completes, the time budget runs out or the run is
//! cancelled. Batches of one table are strictly sequential. Independent
//! tables of a phase may run concurrently; a table whose in-phase
//! prerequisite is part of the same call waits for it to complete.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use strata_core::{
    BatchJob, BatchOutcome, BatchStore, DataPhase, LedgerTable, Result, Shard, TableBatchParams,
};

use crate::lock::CancelHandle;

/// Why a phase call returned before every table completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    Cancelled,
}

/// Progress made by one phase call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    /// Rows touched across all tables in this call.
    pub rows: u64,
    /// Batches committed in this call.
    pub batches: u64,
    /// Requested tables that are complete after this call.
    pub completed_tables: Vec<LedgerTable>,
    /// Requested tables that still have rows to process.
    pub pending_tables: Vec<LedgerTable>,
    /// Set when the call stopped early.
    pub stopped: Option<StopReason>,
}

impl PhaseReport {
    /// Every requested table completed.
    pub fn is_complete(&self) -> bool {
        self.pending_tables.is_empty()
    }
}

#[derive(Debug, Default)]
struct TableRun {
    rows: u64,
    batches: u64,
    completed: bool,
    stopped: Option<StopReason>,
}

/// Engine retry and concurrency settings.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub parallel_tables: bool,
}

/// Drives batches for one phase call.
#[derive(Clone)]
pub struct BatchEngine {
    store: Arc<dyn BatchStore>,
    settings: EngineSettings,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn BatchStore>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Process the requested tables of `phase` for `shard`.
    ///
    /// Store errors are returned wrapped in the phase's error kind after the
    /// local retries for transient failures are used up. Running out of
    /// budget or being cancelled is not an error; see
    /// [`PhaseReport::stopped`].
    pub async fn run_phase(
        &self,
        shard: &Shard,
        phase: DataPhase,
        params: &TableBatchParams,
        cancel: &CancelHandle,
    ) -> Result<PhaseReport> {
        let deadline = Instant::now() + params.time_budget();
        let mut report = PhaseReport::default();

        let mut remaining = Vec::new();
        for &table in params.tables() {
            let progress = self
                .store
                .load_progress(shard.id, phase, table)
                .await
                .map_err(|e| phase.failure(table, &e))?;
            if progress.completed {
                report.completed_tables.push(table);
            } else {
                remaining.push(table);
            }
        }

        while !remaining.is_empty() {
            // tables whose prerequisite is still pending in this call wait
            let (ready, waiting): (Vec<LedgerTable>, Vec<LedgerTable>) =
                remaining.iter().copied().partition(|t| {
                    phase
                        .prerequisite(*t)
                        .map_or(true, |p| !remaining.contains(&p))
                });
            if ready.is_empty() {
                report.pending_tables.extend(waiting);
                break;
            }

            let runs = if self.settings.parallel_tables {
                join_all(
                    ready
                        .iter()
                        .map(|t| self.run_table(shard, phase, *t, params, deadline, cancel)),
                )
                .await
            } else {
                let mut runs = Vec::with_capacity(ready.len());
                for t in &ready {
                    runs.push(self.run_table(shard, phase, *t, params, deadline, cancel).await);
                }
                runs
            };

            let mut wave_stopped = None;
            for (table, run) in ready.iter().zip(runs) {
                let run = run?;
                report.rows += run.rows;
                report.batches += run.batches;
                if run.completed {
                    report.completed_tables.push(*table);
                } else {
                    report.pending_tables.push(*table);
                    wave_stopped = wave_stopped.or(run.stopped);
                }
            }

            if wave_stopped.is_some() || waiting.is_empty() {
                report.pending_tables.extend(waiting);
                report.stopped = wave_stopped;
                break;
            }
            remaining = waiting;
        }

        // keep the phase's processing order in the report
        report
            .completed_tables
            .sort_by_key(|t| phase.tables().iter().position(|p| p == t));
        report
            .pending_tables
            .sort_by_key(|t| phase.tables().iter().position(|p| p == t));
        Ok(report)
    }

    async fn run_table(
        &self,
        shard: &Shard,
        phase: DataPhase,
        table: LedgerTable,
        params: &TableBatchParams,
        deadline: Instant,
        cancel: &CancelHandle,
    ) -> Result<TableRun> {
        let job = BatchJob {
            shard: shard.id,
            range: shard.height_range,
            phase,
            table,
        };
        let mut run = TableRun::default();

        loop {
            if cancel.is_cancelled() {
                run.stopped = Some(StopReason::Cancelled);
                return Ok(run);
            }
            if Instant::now() >= deadline {
                run.stopped = Some(StopReason::BudgetExhausted);
                return Ok(run);
            }

            let outcome = self
                .execute_with_retry(&job, params.batch_size())
                .await
                .map_err(|e| phase.failure(table, &e))?;
            run.rows += outcome.rows;
            run.batches += 1;

            debug!(
                subsystem = "migrate",
                component = "batch_engine",
                op = "batch",
                shard_id = shard.id.value(),
                phase = phase.as_str(),
                table = table.name(),
                rows = outcome.rows,
                completed = outcome.completed,
                "Batch done"
            );

            if outcome.completed {
                run.completed = true;
                return Ok(run);
            }
        }
    }

    async fn execute_with_retry(&self, job: &BatchJob, limit: u32) -> Result<BatchOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.store.execute_batch(job, limit).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let backoff = self.settings.retry_backoff * attempt;
                    warn!(
                        subsystem = "migrate",
                        component = "batch_engine",
                        op = "retry",
                        shard_id = job.shard.value(),
                        table = job.table.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient batch failure, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
