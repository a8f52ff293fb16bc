//! Centralized default constants for shard migration.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// BATCHING
// =============================================================================

/// Default rows per batch transaction.
pub const BATCH_SIZE: u32 = 100;

/// Upper bound on a caller-supplied batch size.
pub const BATCH_SIZE_MAX: u32 = 50_000;

/// Default wall-clock budget for one phase call in milliseconds.
pub const TIME_BUDGET_MS: u64 = 8_000;

/// Transient-error retries for a single batch before it surfaces as a
/// phase failure.
pub const BATCH_MAX_RETRIES: u32 = 3;

/// Base delay between batch retries in milliseconds (multiplied by attempt).
pub const RETRY_BACKOFF_MS: u64 = 200;

/// Copy independent tables concurrently within one phase call.
pub const PARALLEL_TABLES: bool = true;

// =============================================================================
// VERIFICATION
// =============================================================================

/// Verify caller-supplied shard hashes against the shard content.
pub const VERIFY_CONTENT_HASH: bool = true;

/// Rows fetched per round trip while hashing shard content.
pub const HASH_FETCH_SIZE: u32 = 1_000;

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast channel capacity for run lifecycle events.
pub const EVENT_BUS_CAPACITY: usize = 64;

// =============================================================================
// STORAGE
// =============================================================================

/// Default main-store database URL.
pub const DATABASE_URL: &str = "postgres://localhost/strata";

/// Schema holding the main (hot) store.
pub const MAIN_SCHEMA: &str = "public";

/// Prefix of per-shard schemas.
pub const SHARD_SCHEMA_PREFIX: &str = "shard_";

// =============================================================================
// ENVIRONMENT VARIABLES
// =============================================================================

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_BATCH_SIZE: &str = "SHARD_BATCH_SIZE";
pub const ENV_TIME_BUDGET_MS: &str = "SHARD_TIME_BUDGET_MS";
pub const ENV_BATCH_MAX_RETRIES: &str = "SHARD_BATCH_MAX_RETRIES";
pub const ENV_RETRY_BACKOFF_MS: &str = "SHARD_RETRY_BACKOFF_MS";
pub const ENV_PARALLEL_TABLES: &str = "SHARD_PARALLEL_TABLES";
pub const ENV_VERIFY_HASH: &str = "SHARD_VERIFY_HASH";
