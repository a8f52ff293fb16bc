//! Run lifecycle events broadcast by the orchestrator.

use serde::Serialize;

use strata_core::{DataPhase, HeightRange, MigrateState, ShardId};

use crate::batch_engine::StopReason;

/// Events emitted by the migration orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    /// A new run was created in `INIT`.
    RunStarted {
        shard_id: ShardId,
        height_range: HeightRange,
    },
    /// The recorded state moved.
    StateChanged {
        shard_id: ShardId,
        state: MigrateState,
    },
    /// A data phase call returned before every table completed.
    PhasePartial {
        shard_id: ShardId,
        phase: DataPhase,
        rows: u64,
        stopped: Option<StopReason>,
    },
    /// The run was marked `FAILED`.
    RunFailed {
        shard_id: ShardId,
        operation: &'static str,
        error: String,
    },
    /// The shard was registered and the run reached `COMPLETED`.
    RunCompleted { shard_id: ShardId },
    /// An operator discarded the run and its shard store.
    RunDiscarded { shard_id: ShardId },
}
