//! Connection pool sized for batch phases.
//!
//! With parallel tables every table of a phase holds one connection for its
//! batch transaction while the run record needs one more for state changes.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use strata_core::{DataPhase, Error, Result};

/// Connections kept free for run state and registry reads.
pub const STATE_CONNECTIONS: u32 = 1;

/// Acquire timeout in seconds.
pub const ACQUIRE_TIMEOUT_SECS: u64 = 30;

const IDLE_TIMEOUT_SECS: u64 = 600;
const MAX_LIFETIME_SECS: u64 = 1800;

const DATA_PHASES: [DataPhase; 4] = [
    DataPhase::Copy,
    DataPhase::Relink,
    DataPhase::Index,
    DataPhase::Delete,
];

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_batches(true)
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool large enough that no batch of a phase waits on a connection.
    pub fn for_batches(parallel_tables: bool) -> Self {
        let batch_connections = if parallel_tables {
            DATA_PHASES
                .iter()
                .map(|phase| phase.tables().len() as u32)
                .max()
                .unwrap_or(1)
        } else {
            1
        };
        Self {
            max_connections: batch_connections + STATE_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(MAX_LIFETIME_SECS)),
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }
}

/// Create a pool sized for parallel batches.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Creating ledger connection pool"
    );

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(max_lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Ledger connection pool established"
    );
    Ok(pool)
}

/// Log pool usage, warning when every connection is checked out.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle() as u32;

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool usage"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "No idle connections left, parallel batches may queue"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_pool_fits_widest_phase() {
        let config = PoolConfig::for_batches(true);
        // relink touches five tables at once
        assert_eq!(config.max_connections, 5 + STATE_CONNECTIONS);
        assert_eq!(PoolConfig::default().max_connections, config.max_connections);
    }

    #[test]
    fn test_sequential_pool_needs_one_batch_connection() {
        let config = PoolConfig::for_batches(false);
        assert_eq!(config.max_connections, 1 + STATE_CONNECTIONS);
        assert_eq!(config.acquire_timeout, Duration::from_secs(ACQUIRE_TIMEOUT_SECS));
        assert_eq!(PoolConfig::new().max_connections(3).max_connections, 3);
    }
}
