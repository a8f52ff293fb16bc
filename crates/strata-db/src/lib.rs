//! # strata-db
//!
//! PostgreSQL storage layer for ledger shard migration.
//!
//! This crate provides:
//! - Connection pool management
//! - Versioned DDL for shard stores (`shard_<boundary>` schemas)
//! - Batch SQL for the copy, relink, index and delete phases
//! - Durable run state and per-table progress markers
//! - The completed shard registry
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_db::{Database, ShardRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/strata").await?;
//!
//!     if let Some(shard) = db.registry.lookup(1_250).await? {
//!         println!("height 1250 lives in {}", shard.id);
//!     }
//!     Ok(())
//! }
//! ```
pub mod batches;
pub mod ledger_schema;
pub mod pool;
pub mod registry;
pub mod runs;
pub mod schema_names;
pub mod shard_schema;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use strata_core::*;

pub use batches::{batch_sql, PgBatchRepository};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use registry::PgShardRegistry;
pub use runs::PgMigrationStateRepository;
pub use schema_names::{main_schema_name, shard_schema_name, validate_schema_name};
pub use shard_schema::{schema_ddl, PgShardSchemaRepository};

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Run state and operator recovery actions.
    pub runs: PgMigrationStateRepository,
    /// Completed shard catalog.
    pub registry: PgShardRegistry,
    /// Shard store DDL.
    pub schemas: PgShardSchemaRepository,
    /// Batched phase execution and progress markers.
    pub batches: PgBatchRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            runs: PgMigrationStateRepository::new(pool.clone()),
            registry: PgShardRegistry::new(pool.clone()),
            schemas: PgShardSchemaRepository::new(pool.clone()),
            batches: PgBatchRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}
