//! Migration configuration.

use std::time::Duration;

use strata_core::defaults;
use strata_core::{CopyParams, DeleteParams, IndexParams, RelinkParams, Result};

/// Configuration for shard migration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Rows per batch for phase calls built from this config.
    pub batch_size: u32,
    /// Wall-clock budget per phase call in milliseconds.
    pub time_budget_ms: u64,
    /// Local retries of a batch that failed with a transient store error.
    pub batch_max_retries: u32,
    /// Backoff base between retries; attempt `n` waits `n * base`.
    pub retry_backoff_ms: u64,
    /// Run independent tables of a phase concurrently.
    pub parallel_tables: bool,
    /// Recompute the shard content hash at finalization and reject a
    /// mismatching caller hash.
    pub verify_content_hash: bool,
    /// Rows fetched per round trip while hashing shard content.
    pub hash_fetch_size: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            time_budget_ms: defaults::TIME_BUDGET_MS,
            batch_max_retries: defaults::BATCH_MAX_RETRIES,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            parallel_tables: defaults::PARALLEL_TABLES,
            verify_content_hash: defaults::VERIFY_CONTENT_HASH,
            hash_fetch_size: defaults::HASH_FETCH_SIZE,
        }
    }
}

impl MigrationConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SHARD_BATCH_SIZE` | `100` | Rows per batch |
    /// | `SHARD_TIME_BUDGET_MS` | `8000` | Budget per phase call |
    /// | `SHARD_BATCH_MAX_RETRIES` | `3` | Transient retries per batch |
    /// | `SHARD_RETRY_BACKOFF_MS` | `200` | Linear backoff base |
    /// | `SHARD_PARALLEL_TABLES` | `true` | Concurrent independent tables |
    /// | `SHARD_VERIFY_HASH` | `true` | Verify caller hash at finalization |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to defaults and the batch size is clamped to the supported range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default)
        };

        let batch_size = lookup(defaults::ENV_BATCH_SIZE)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::BATCH_SIZE)
            .clamp(1, defaults::BATCH_SIZE_MAX);

        let time_budget_ms = lookup(defaults::ENV_TIME_BUDGET_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TIME_BUDGET_MS)
            .max(1);

        let batch_max_retries = lookup(defaults::ENV_BATCH_MAX_RETRIES)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::BATCH_MAX_RETRIES);

        let retry_backoff_ms = lookup(defaults::ENV_RETRY_BACKOFF_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_BACKOFF_MS);

        Self {
            batch_size,
            time_budget_ms,
            batch_max_retries,
            retry_backoff_ms,
            parallel_tables: flag(defaults::ENV_PARALLEL_TABLES, defaults::PARALLEL_TABLES),
            verify_content_hash: flag(defaults::ENV_VERIFY_HASH, defaults::VERIFY_CONTENT_HASH),
            hash_fetch_size: defaults::HASH_FETCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, rows: u32) -> Self {
        self.batch_size = rows;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_ms = budget.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.batch_max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_parallel_tables(mut self, parallel: bool) -> Self {
        self.parallel_tables = parallel;
        self
    }

    pub fn with_verify_content_hash(mut self, verify: bool) -> Self {
        self.verify_content_hash = verify;
        self
    }

    pub fn with_hash_fetch_size(mut self, rows: u32) -> Self {
        self.hash_fetch_size = rows.max(1);
        self
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Copy parameters for every copy table.
    pub fn copy_params(&self) -> Result<CopyParams> {
        CopyParams::all_with(self.batch_size, self.time_budget())
    }

    /// Relink parameters for every derived table.
    pub fn relink_params(&self) -> Result<RelinkParams> {
        RelinkParams::all_with(self.batch_size, self.time_budget())
    }

    /// Index parameters for every secondary index.
    pub fn index_params(&self) -> Result<IndexParams> {
        IndexParams::all_with(self.batch_size, self.time_budget())
    }

    /// Delete parameters for every copied table.
    pub fn delete_params(&self) -> Result<DeleteParams> {
        DeleteParams::all_with(self.batch_size, self.time_budget())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> MigrationConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MigrationConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(config_from(&[]), MigrationConfig::default());
        let config = MigrationConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.time_budget(), Duration::from_millis(8000));
        assert!(config.parallel_tables);
        assert!(config.verify_content_hash);
    }

    #[test]
    fn test_reads_overrides() {
        let config = config_from(&[
            ("SHARD_BATCH_SIZE", "500"),
            ("SHARD_TIME_BUDGET_MS", "2500"),
            ("SHARD_BATCH_MAX_RETRIES", "5"),
            ("SHARD_RETRY_BACKOFF_MS", "50"),
            ("SHARD_PARALLEL_TABLES", "false"),
            ("SHARD_VERIFY_HASH", "0"),
        ]);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.time_budget_ms, 2500);
        assert_eq!(config.batch_max_retries, 5);
        assert_eq!(config.retry_backoff(), Duration::from_millis(50));
        assert!(!config.parallel_tables);
        assert!(!config.verify_content_hash);
    }

    #[test]
    fn test_bad_values_fall_back_or_clamp() {
        let config = config_from(&[
            ("SHARD_BATCH_SIZE", "0"),
            ("SHARD_TIME_BUDGET_MS", "soon"),
        ]);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.time_budget_ms, defaults::TIME_BUDGET_MS);

        let config = config_from(&[("SHARD_BATCH_SIZE", "99999999")]);
        assert_eq!(config.batch_size, defaults::BATCH_SIZE_MAX);
    }

    #[test]
    fn test_builds_full_phase_params() {
        let config = MigrationConfig::default()
            .with_batch_size(7)
            .with_time_budget(Duration::from_secs(1));
        let params = config.copy_params().unwrap();
        assert_eq!(params.batch().batch_size(), 7);
        assert_eq!(params.batch().time_budget(), Duration::from_secs(1));
        assert_eq!(
            config.delete_params().unwrap().batch().tables(),
            strata_core::DataPhase::Delete.tables()
        );
    }
}
