//! Structured logging schema and field name constants.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query by the same keys across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Run moved to FAILED, requires operator attention |
//! | WARN  | Partial return (budget, cancellation), transient batch retry |
//! | INFO  | State transitions, phase completions, run lifecycle |
//! | DEBUG | Per-batch progress, skipped tables, schema no-ops |
//! | TRACE | Per-row detail while hashing shard content |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "migrate", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "orchestrator", "batch_engine", "registry", "schema"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "copy_data_to_shard", "apply_schema", "execute_batch"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Shard id of the run being operated on.
pub const SHARD_ID: &str = "shard_id";

/// Ledger table name.
pub const TABLE: &str = "table";

/// Data phase ("copy", "relink", "index", "delete").
pub const PHASE: &str = "phase";

/// Migration state after the event.
pub const STATE: &str = "state";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Rows affected by a batch or phase.
pub const ROWS: &str = "rows";

/// Batches executed in one phase call.
pub const BATCHES: &str = "batches";

/// Retry attempt number for a transient batch failure.
pub const ATTEMPT: &str = "attempt";
