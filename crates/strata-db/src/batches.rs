//! Batched row movement for the four data phases.
//!
//! Every batch is one local transaction that locks the table's progress row,
//! moves at most `limit` rows past the stored cursor and writes the advanced
//! cursor back. A crash therefore loses either the whole batch or nothing,
//! and re-running a phase resumes exactly after the last committed batch.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use strata_core::{
    BatchJob, BatchOutcome, BatchStore, DataPhase, Error, HeightRange, KeyedRow, LedgerTable,
    Result, ShardId, StoreLocation, TableProgress,
};

use crate::ledger_schema::{column_list, shard_columns, HEIGHT_COLUMN, KEY_COLUMN};
use crate::schema_names::{main_schema_name, shard_schema_name};

/// Cursor value before the first batch; `db_id` sequences start at 1.
const CURSOR_START: i64 = 0;

/// SQL for one batch of `phase` on `table`.
///
/// The statement returns one row with `batch_rows` and `last_key`.
/// Placeholders per phase:
/// - copy, delete: `$1` height from, `$2` height to, `$3` cursor, `$4` limit
/// - relink: `$1` snapshot height, `$2` cursor, `$3` limit
/// - index: `$1` cursor, `$2` limit, `$3` shard id
pub fn batch_sql(phase: DataPhase, table: LedgerTable, shard_schema: &str) -> Result<String> {
    let main = main_schema_name();
    let t = table.name();

    let body = match phase {
        DataPhase::Copy => {
            let columns = copy_columns(table)?;
            format!(
                "WITH batch AS (\
                 SELECT {cols} FROM {main}.{t} \
                 WHERE {h} >= $1 AND {h} < $2 AND db_id > $3 \
                 ORDER BY db_id LIMIT $4), \
                 moved AS (\
                 INSERT INTO {shard}.{t} ({cols}) SELECT {cols} FROM batch \
                 ON CONFLICT (db_id) DO NOTHING)",
                cols = columns,
                h = HEIGHT_COLUMN,
                main = main,
                shard = shard_schema,
                t = t
            )
        }
        DataPhase::Relink => format!(
            "WITH batch AS (\
             SELECT db_id FROM {main}.{t} \
             WHERE {h} < $1 AND db_id > $2 \
             ORDER BY db_id LIMIT $3 FOR UPDATE), \
             moved AS (\
             UPDATE {main}.{t} AS r SET {h} = $1 \
             FROM batch WHERE r.db_id = batch.db_id)",
            h = HEIGHT_COLUMN,
            main = main,
            t = t
        ),
        DataPhase::Index => match table {
            LedgerTable::BlockIndex => format!(
                "WITH batch AS (\
                 SELECT db_id, id, height FROM {shard}.block \
                 WHERE db_id > $1 ORDER BY db_id LIMIT $2), \
                 moved AS (\
                 INSERT INTO {main}.block_index (block_id, height, shard_id) \
                 SELECT id, height, $3::BIGINT FROM batch \
                 ON CONFLICT (block_id) DO UPDATE \
                 SET height = EXCLUDED.height, shard_id = EXCLUDED.shard_id)",
                main = main,
                shard = shard_schema
            ),
            LedgerTable::TransactionShardIndex => format!(
                "WITH batch AS (\
                 SELECT db_id, id, block_id, height, full_hash FROM {shard}.transaction \
                 WHERE db_id > $1 ORDER BY db_id LIMIT $2), \
                 moved AS (\
                 INSERT INTO {main}.transaction_shard_index \
                 (transaction_id, block_id, height, full_hash, shard_id) \
                 SELECT id, block_id, height, full_hash, $3::BIGINT FROM batch \
                 ON CONFLICT (transaction_id) DO UPDATE \
                 SET height = EXCLUDED.height, shard_id = EXCLUDED.shard_id)",
                main = main,
                shard = shard_schema
            ),
            other => return Err(not_in_phase(phase, other)),
        },
        DataPhase::Delete => {
            copy_columns(table)?;
            format!(
                "WITH batch AS (\
                 SELECT m.db_id FROM {main}.{t} m \
                 WHERE m.{h} >= $1 AND m.{h} < $2 AND m.db_id > $3 \
                 AND EXISTS (SELECT 1 FROM {shard}.{t} s WHERE s.db_id = m.db_id) \
                 ORDER BY m.db_id LIMIT $4 FOR UPDATE), \
                 moved AS (\
                 DELETE FROM {main}.{t} m USING batch WHERE m.db_id = batch.db_id)",
                h = HEIGHT_COLUMN,
                main = main,
                shard = shard_schema,
                t = t
            )
        }
    };

    if !phase.tables().contains(&table) {
        return Err(not_in_phase(phase, table));
    }

    Ok(format!(
        "{} SELECT COUNT(*) AS batch_rows, MAX(db_id) AS last_key FROM batch",
        body
    ))
}

fn copy_columns(table: LedgerTable) -> Result<String> {
    shard_columns(table)
        .map(|columns| column_list(columns, None))
        .ok_or_else(|| {
            Error::InvalidInput(format!("table {} is not stored in shard stores", table))
        })
}

fn not_in_phase(phase: DataPhase, table: LedgerTable) -> Error {
    Error::InvalidInput(format!("table {} is not part of the {} phase", table, phase))
}

/// PostgreSQL implementation of BatchStore.
pub struct PgBatchRepository {
    pool: Pool<Postgres>,
}

impl PgBatchRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PgBatchRepository {
    async fn load_progress(
        &self,
        shard: ShardId,
        phase: DataPhase,
        table: LedgerTable,
    ) -> Result<TableProgress> {
        let row = sqlx::query(
            "SELECT last_key, rows_done, completed FROM shard_migration_progress \
             WHERE shard_id = $1 AND phase = $2 AND table_name = $3",
        )
        .bind(shard.value())
        .bind(phase.as_str())
        .bind(table.name())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row
            .map(|r| TableProgress {
                last_key: r.get("last_key"),
                rows_done: r.get::<i64, _>("rows_done").max(0) as u64,
                completed: r.get("completed"),
            })
            .unwrap_or_default())
    }

    async fn execute_batch(&self, job: &BatchJob, limit: u32) -> Result<BatchOutcome> {
        let start = Instant::now();
        let schema = shard_schema_name(job.shard)?;
        let sql = batch_sql(job.phase, job.table, &schema)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let progress = sqlx::query(
            "SELECT last_key, completed FROM shard_migration_progress \
             WHERE shard_id = $1 AND phase = $2 AND table_name = $3 FOR UPDATE",
        )
        .bind(job.shard.value())
        .bind(job.phase.as_str())
        .bind(job.table.name())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let (previous_key, already_done): (Option<i64>, bool) = progress
            .map(|r| (r.get("last_key"), r.get("completed")))
            .unwrap_or((None, false));
        if already_done {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(BatchOutcome {
                rows: 0,
                last_key: previous_key,
                completed: true,
            });
        }

        let cursor = previous_key.unwrap_or(CURSOR_START);
        let query = sqlx::query(&sql);
        let query = match job.phase {
            DataPhase::Copy | DataPhase::Delete => query
                .bind(job.range.from)
                .bind(job.range.to)
                .bind(cursor)
                .bind(i64::from(limit)),
            DataPhase::Relink => query
                .bind(job.range.to)
                .bind(cursor)
                .bind(i64::from(limit)),
            DataPhase::Index => query
                .bind(cursor)
                .bind(i64::from(limit))
                .bind(job.shard.value()),
        };
        let row = query.fetch_one(&mut *tx).await.map_err(Error::Database)?;
        let rows: i64 = row.get("batch_rows");
        let batch_key: Option<i64> = row.get("last_key");

        let outcome = BatchOutcome {
            rows: rows.max(0) as u64,
            last_key: batch_key.or(previous_key),
            completed: rows < i64::from(limit),
        };

        sqlx::query(
            "INSERT INTO shard_migration_progress \
             (shard_id, phase, table_name, last_key, rows_done, completed, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (shard_id, phase, table_name) DO UPDATE SET \
             last_key = COALESCE(EXCLUDED.last_key, shard_migration_progress.last_key), \
             rows_done = shard_migration_progress.rows_done + EXCLUDED.rows_done, \
             completed = EXCLUDED.completed, \
             updated_at = NOW()",
        )
        .bind(job.shard.value())
        .bind(job.phase.as_str())
        .bind(job.table.name())
        .bind(outcome.last_key)
        .bind(rows)
        .bind(outcome.completed)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "batch",
            op = "execute_batch",
            shard_id = job.shard.value(),
            phase = job.phase.as_str(),
            table = job.table.name(),
            rows = outcome.rows,
            last_key = outcome.last_key,
            completed = outcome.completed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(outcome)
    }

    async fn count_in_range(
        &self,
        location: StoreLocation,
        table: LedgerTable,
        range: HeightRange,
    ) -> Result<u64> {
        let schema = match location {
            StoreLocation::Main => main_schema_name().to_string(),
            StoreLocation::Shard(shard) => {
                copy_columns(table)?;
                shard_schema_name(shard)?
            }
        };

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {schema}.{t} WHERE {h} >= $1 AND {h} < $2",
            schema = schema,
            t = table.name(),
            h = HEIGHT_COLUMN
        ))
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(count.max(0) as u64)
    }

    async fn fetch_shard_rows(
        &self,
        shard: ShardId,
        table: LedgerTable,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<KeyedRow>> {
        copy_columns(table)?;
        let schema = shard_schema_name(shard)?;

        // jsonb orders keys, which makes the text canonical per row
        let rows = sqlx::query(&format!(
            "SELECT t.{key} AS key, to_jsonb(t)::text AS body FROM {schema}.{table} t \
             WHERE t.{key} > $1 ORDER BY t.{key} LIMIT $2",
            key = KEY_COLUMN,
            schema = schema,
            table = table.name()
        ))
        .bind(after.unwrap_or(CURSOR_START))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| KeyedRow {
                key: r.get("key"),
                bytes: r.get::<String, _>("body").into_bytes(),
            })
            .collect())
    }

    async fn block_exists(&self, height: i64) -> Result<bool> {
        sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {}.block WHERE height = $1)",
            main_schema_name()
        ))
        .bind(height)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn clear_progress(&self, shard: ShardId) -> Result<()> {
        sqlx::query("DELETE FROM shard_migration_progress WHERE shard_id = $1")
            .bind(shard.value())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn clear_index_entries(&self, shard: ShardId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut removed = 0;
        for table in DataPhase::Index.tables() {
            removed += sqlx::query(&index_cleanup_sql(*table)?)
                .bind(shard.value())
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?
                .rows_affected();
        }
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "batch",
            op = "clear_index_entries",
            shard_id = shard.value(),
            removed,
            "Index entries removed"
        );
        Ok(removed)
    }
}

/// SQL removing the index entries of one shard from an index table.
pub fn index_cleanup_sql(table: LedgerTable) -> Result<String> {
    if !DataPhase::Index.tables().contains(&table) {
        return Err(not_in_phase(DataPhase::Index, table));
    }
    Ok(format!(
        "DELETE FROM {}.{} WHERE shard_id = $1",
        main_schema_name(),
        table.name()
    ))
}
