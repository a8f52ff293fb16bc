//! Durable shard run state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{error, info};

use strata_core::{
    Error, HeightRange, MigrateState, MigrationStateStore, Result, Shard, ShardHash, ShardId,
};

/// Partial unique index allowing a single unfinished run.
const ONE_UNFINISHED_INDEX: &str = "shard_one_unfinished_idx";

/// Columns selected for every shard row.
pub(crate) const SHARD_COLUMNS: &str = "shard_id, height_from, height_to, shard_hash, state, \
     last_completed_state, failure_reason, created_at, updated_at";

/// Map a `shard` row to the domain record.
pub(crate) fn shard_from_row(row: &PgRow) -> Result<Shard> {
    let shard_hash: Option<Vec<u8>> = row.get("shard_hash");
    let state: String = row.get("state");
    let last_completed_state: String = row.get("last_completed_state");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Shard {
        id: ShardId(row.get("shard_id")),
        height_range: HeightRange::new(row.get("height_from"), row.get("height_to"))?,
        shard_hash: shard_hash.map(ShardHash::new).transpose()?,
        state: state.parse()?,
        last_completed_state: last_completed_state.parse()?,
        failure_reason: row.get("failure_reason"),
        created_at,
        updated_at,
    })
}

/// PostgreSQL implementation of MigrationStateStore.
pub struct PgMigrationStateRepository {
    pool: Pool<Postgres>,
}

impl PgMigrationStateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Explain a rejected compare-and-set by reading the current row.
    async fn rejected(
        &self,
        id: ShardId,
        operation: &'static str,
        required: MigrateState,
    ) -> Error {
        match self.load_run(id).await {
            Ok(Some(shard)) => Error::InvalidTransition {
                operation,
                current: shard.state,
                required,
            },
            Ok(None) => Error::NotInitialized(format!("no shard run {}", id)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MigrationStateStore for PgMigrationStateRepository {
    async fn create_run(&self, shard: &Shard) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO shard (shard_id, height_from, height_to, shard_hash, state, \
             last_completed_state, failure_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, NULL, $4, $5, NULL, $6, $6)",
        )
        .bind(shard.id.value())
        .bind(shard.height_range.from)
        .bind(shard.height_range.to)
        .bind(shard.state.as_str())
        .bind(shard.last_completed_state.as_str())
        .bind(shard.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(
                    subsystem = "db",
                    component = "runs",
                    op = "create_run",
                    shard_id = shard.id.value(),
                    height_from = shard.height_range.from,
                    height_to = shard.height_range.to,
                    "Created shard run"
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                if db_err.constraint() == Some(ONE_UNFINISHED_INDEX) {
                    Err(Error::RunInProgress(
                        "another shard run has not completed".to_string(),
                    ))
                } else {
                    Err(Error::InvalidInput(format!(
                        "shard {} already exists",
                        shard.id
                    )))
                }
            }
            Err(e) => Err(Error::Database(e)),
        }
    }

    async fn unfinished_run(&self) -> Result<Option<Shard>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM shard WHERE state <> 'COMPLETED' LIMIT 1",
            SHARD_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(shard_from_row).transpose()
    }

    async fn load_run(&self, id: ShardId) -> Result<Option<Shard>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM shard WHERE shard_id = $1",
            SHARD_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(shard_from_row).transpose()
    }

    async fn transition(&self, id: ShardId, from: MigrateState, to: MigrateState) -> Result<Shard> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidInput(format!(
                "{} cannot move to {}",
                from, to
            )));
        }
        let forward = from.next() == Some(to);

        let row = sqlx::query(&format!(
            "UPDATE shard SET state = $3, \
             last_completed_state = CASE WHEN $4 THEN $3 ELSE last_completed_state END, \
             failure_reason = NULL, updated_at = NOW() \
             WHERE shard_id = $1 AND state = $2 \
             RETURNING {}",
            SHARD_COLUMNS
        ))
        .bind(id.value())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(forward)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let shard = shard_from_row(&row)?;
                info!(
                    subsystem = "db",
                    component = "runs",
                    op = "transition",
                    shard_id = id.value(),
                    from = from.as_str(),
                    state = to.as_str(),
                    "Shard run state advanced"
                );
                Ok(shard)
            }
            None => Err(self.rejected(id, "transition", from).await),
        }
    }

    async fn mark_failed(&self, id: ShardId, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE shard SET state = 'FAILED', failure_reason = $2, updated_at = NOW() \
             WHERE shard_id = $1 AND state NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(id.value())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        error!(
            subsystem = "db",
            component = "runs",
            op = "mark_failed",
            shard_id = id.value(),
            reason,
            "Shard run failed"
        );
        Ok(())
    }

    async fn restart_failed(&self, id: ShardId) -> Result<Shard> {
        let row = sqlx::query(&format!(
            "UPDATE shard SET state = last_completed_state, failure_reason = NULL, \
             updated_at = NOW() \
             WHERE shard_id = $1 AND state = 'FAILED' \
             RETURNING {}",
            SHARD_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let shard = shard_from_row(&row)?;
                info!(
                    subsystem = "db",
                    component = "runs",
                    op = "restart_failed",
                    shard_id = id.value(),
                    state = shard.state.as_str(),
                    "Failed shard run restarted"
                );
                Ok(shard)
            }
            None => Err(self
                .rejected(id, "restart_failed", MigrateState::Failed)
                .await),
        }
    }

    async fn delete_run(&self, id: ShardId) -> Result<()> {
        let result = sqlx::query("DELETE FROM shard WHERE shard_id = $1 AND state <> 'COMPLETED'")
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("unfinished shard run {}", id)));
        }
        Ok(())
    }

    async fn latest_completed_boundary(&self) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT MAX(height_to) FROM shard WHERE state = 'COMPLETED'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}
