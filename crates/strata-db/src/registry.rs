//! Completed shard catalog.
//!
//! Completed shards share the `shard` table with in-flight runs; the
//! registry only ever reads rows in `COMPLETED` and writes the single
//! `DATA_REMOVED_FROM_MAIN → COMPLETED` step.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::info;

use strata_core::{Error, MigrateState, Result, Shard, ShardId, ShardRegistry};

use crate::runs::{shard_from_row, SHARD_COLUMNS};

/// PostgreSQL implementation of ShardRegistry.
pub struct PgShardRegistry {
    pool: Pool<Postgres>,
}

impl PgShardRegistry {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShardRegistry for PgShardRegistry {
    async fn register(&self, shard: &Shard) -> Result<Shard> {
        let hash = shard.shard_hash.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("shard {} has no content hash", shard.id))
        })?;

        let row = sqlx::query(&format!(
            "UPDATE shard SET shard_hash = $2, state = 'COMPLETED', \
             last_completed_state = 'COMPLETED', failure_reason = NULL, updated_at = NOW() \
             WHERE shard_id = $1 AND state = 'DATA_REMOVED_FROM_MAIN' \
             RETURNING {}",
            SHARD_COLUMNS
        ))
        .bind(shard.id.value())
        .bind(hash.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            let current = sqlx::query_scalar::<_, String>("SELECT state FROM shard WHERE shard_id = $1")
                .bind(shard.id.value())
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
            return match current {
                Some(state) => Err(Error::InvalidTransition {
                    operation: "add_shard_info",
                    current: state.parse()?,
                    required: MigrateState::DataRemovedFromMain,
                }),
                None => Err(Error::NotInitialized(format!("no shard run {}", shard.id))),
            };
        };

        let registered = shard_from_row(&row)?;
        info!(
            subsystem = "db",
            component = "registry",
            op = "register",
            shard_id = registered.id.value(),
            height_from = registered.height_range.from,
            height_to = registered.height_range.to,
            shard_hash = %hash,
            "Shard registered"
        );
        Ok(registered)
    }

    async fn lookup(&self, height: i64) -> Result<Option<Shard>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM shard \
             WHERE state = 'COMPLETED' AND height_from <= $1 AND height_to > $1",
            SHARD_COLUMNS
        ))
        .bind(height)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(shard_from_row).transpose()
    }

    async fn get(&self, id: ShardId) -> Result<Option<Shard>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM shard WHERE shard_id = $1 AND state = 'COMPLETED'",
            SHARD_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(shard_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Shard>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM shard WHERE state = 'COMPLETED' ORDER BY height_from",
            SHARD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(shard_from_row).collect()
    }
}
