//! Versioned shard store DDL.
//!
//! Version 1 creates bare tables for unindexed inserts; version 2 adds keys,
//! the block foreign key and lookup indexes. Each version is applied in one
//! transaction together with its `schema_version` row.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::info;

use strata_core::{Error, LedgerTable, Result, ShardId, ShardSchemaStore, ShardSchemaVersion};

use crate::ledger_schema::{column_definitions, shard_columns};
use crate::schema_names::shard_schema_name;

/// DDL statements for one schema version of the shard store `schema`.
pub fn schema_ddl(schema: &str, version: ShardSchemaVersion) -> Vec<String> {
    match version {
        ShardSchemaVersion::Init => {
            let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS {}", schema)];
            for table in [LedgerTable::Block, LedgerTable::Transaction] {
                if let Some(columns) = shard_columns(table) {
                    statements.push(format!(
                        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
                        schema,
                        table.name(),
                        column_definitions(columns)
                    ));
                }
            }
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {}.schema_version (\
                 version INTEGER NOT NULL, \
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
                schema
            ));
            statements
        }
        ShardSchemaVersion::Full => vec![
            format!(
                "ALTER TABLE {s}.block ADD CONSTRAINT block_pkey PRIMARY KEY (db_id)",
                s = schema
            ),
            format!(
                "ALTER TABLE {s}.block ADD CONSTRAINT block_id_key UNIQUE (id)",
                s = schema
            ),
            format!(
                "ALTER TABLE {s}.block ADD CONSTRAINT block_height_key UNIQUE (height)",
                s = schema
            ),
            format!(
                "ALTER TABLE {s}.transaction ADD CONSTRAINT transaction_pkey PRIMARY KEY (db_id)",
                s = schema
            ),
            format!(
                "ALTER TABLE {s}.transaction ADD CONSTRAINT transaction_block_id_fkey \
                 FOREIGN KEY (block_id) REFERENCES {s}.block (id)",
                s = schema
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS transaction_id_idx ON {s}.transaction (id)",
                s = schema
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS transaction_height_idx ON {s}.transaction (height)",
                s = schema
            ),
        ],
    }
}

/// PostgreSQL implementation of ShardSchemaStore.
pub struct PgShardSchemaRepository {
    pool: Pool<Postgres>,
}

impl PgShardSchemaRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShardSchemaStore for PgShardSchemaRepository {
    async fn schema_version(&self, shard: ShardId) -> Result<Option<ShardSchemaVersion>> {
        let schema = shard_schema_name(shard)?;

        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(format!("{}.schema_version", schema))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        if !exists {
            return Ok(None);
        }

        let version: Option<i32> =
            sqlx::query_scalar(&format!("SELECT MAX(version) FROM {}.schema_version", schema))
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;

        match version {
            None => Ok(None),
            Some(n) => ShardSchemaVersion::from_number(n).map(Some).ok_or_else(|| {
                Error::Schema(format!("{} records unknown schema version {}", schema, n))
            }),
        }
    }

    async fn apply_schema(&self, shard: ShardId, version: ShardSchemaVersion) -> Result<()> {
        let schema = shard_schema_name(shard)?;
        let start = Instant::now();
        let ddl_error =
            |e: sqlx::Error| Error::Schema(format!("{} schema on {}: {}", version, schema, e));

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for statement in schema_ddl(&schema, version) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(ddl_error)?;
        }
        sqlx::query(&format!(
            "INSERT INTO {}.schema_version (version) VALUES ($1)",
            schema
        ))
        .bind(version.number())
        .execute(&mut *tx)
        .await
        .map_err(ddl_error)?;
        tx.commit().await.map_err(ddl_error)?;

        info!(
            subsystem = "db",
            component = "schema",
            op = "apply_schema",
            shard_id = shard.value(),
            version = version.number(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Applied shard schema version"
        );
        Ok(())
    }

    async fn drop_shard_store(&self, shard: ShardId) -> Result<()> {
        let schema = shard_schema_name(shard)?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "schema",
            op = "drop_shard_store",
            shard_id = shard.value(),
            "Dropped shard store"
        );
        Ok(())
    }
}
