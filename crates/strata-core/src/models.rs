//! Shard records and the migration state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// MIGRATION STATE
// =============================================================================

/// Named states a single shard-creation run passes through.
///
/// Forward order is fixed; `Failed` is absorbing and reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrateState {
    Init,
    ShardSchemaCreated,
    ShardSchemaFull,
    DataCopiedToShard,
    DataRelinkedInMain,
    SecondaryIndexUpdated,
    DataRemovedFromMain,
    Completed,
    Failed,
}

impl MigrateState {
    /// The forward path, `Failed` excluded.
    pub const FORWARD_ORDER: [MigrateState; 8] = [
        MigrateState::Init,
        MigrateState::ShardSchemaCreated,
        MigrateState::ShardSchemaFull,
        MigrateState::DataCopiedToShard,
        MigrateState::DataRelinkedInMain,
        MigrateState::SecondaryIndexUpdated,
        MigrateState::DataRemovedFromMain,
        MigrateState::Completed,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrateState::Init => "INIT",
            MigrateState::ShardSchemaCreated => "SHARD_SCHEMA_CREATED",
            MigrateState::ShardSchemaFull => "SHARD_SCHEMA_FULL",
            MigrateState::DataCopiedToShard => "DATA_COPIED_TO_SHARD",
            MigrateState::DataRelinkedInMain => "DATA_RELINKED_IN_MAIN",
            MigrateState::SecondaryIndexUpdated => "SECONDARY_INDEX_UPDATED",
            MigrateState::DataRemovedFromMain => "DATA_REMOVED_FROM_MAIN",
            MigrateState::Completed => "COMPLETED",
            MigrateState::Failed => "FAILED",
        }
    }

    /// Position on the forward path, `None` for `Failed`.
    pub fn ordinal(&self) -> Option<usize> {
        Self::FORWARD_ORDER.iter().position(|s| s == self)
    }

    /// The state one step further along the forward path.
    pub fn next(&self) -> Option<MigrateState> {
        self.ordinal()
            .and_then(|i| Self::FORWARD_ORDER.get(i + 1))
            .copied()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrateState::Completed | MigrateState::Failed)
    }

    /// Whether `to` is a legal single transition from this state.
    pub fn can_transition_to(&self, to: MigrateState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == MigrateState::Failed || self.next() == Some(to)
    }

    /// Whether main-store rows may already have been deleted in this state.
    pub fn main_data_removed(&self) -> bool {
        matches!(
            self,
            MigrateState::DataRemovedFromMain | MigrateState::Completed
        )
    }
}

impl fmt::Display for MigrateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrateState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INIT" => Ok(MigrateState::Init),
            "SHARD_SCHEMA_CREATED" => Ok(MigrateState::ShardSchemaCreated),
            "SHARD_SCHEMA_FULL" => Ok(MigrateState::ShardSchemaFull),
            "DATA_COPIED_TO_SHARD" => Ok(MigrateState::DataCopiedToShard),
            "DATA_RELINKED_IN_MAIN" => Ok(MigrateState::DataRelinkedInMain),
            "SECONDARY_INDEX_UPDATED" => Ok(MigrateState::SecondaryIndexUpdated),
            "DATA_REMOVED_FROM_MAIN" => Ok(MigrateState::DataRemovedFromMain),
            "COMPLETED" => Ok(MigrateState::Completed),
            "FAILED" => Ok(MigrateState::Failed),
            other => Err(Error::Serialization(format!(
                "unknown migration state: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// SHARD IDENTITY
// =============================================================================

/// Shard identifier, equal to the shard's exclusive upper boundary height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub i64);

impl ShardId {
    pub fn for_boundary(range: &HeightRange) -> Self {
        ShardId(range.to)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block heights covered by a shard: `from` inclusive, `to` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeightRange {
    pub from: i64,
    pub to: i64,
}

impl HeightRange {
    /// Create a non-empty, non-negative range.
    pub fn new(from: i64, to: i64) -> Result<Self> {
        if from < 0 {
            return Err(Error::InvalidInput(format!(
                "shard lower bound must be non-negative, got {}",
                from
            )));
        }
        if to <= from {
            return Err(Error::InvalidInput(format!(
                "shard boundary {} must be above lower bound {}",
                to, from
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, height: i64) -> bool {
        height >= self.from && height < self.to
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Content digest over a shard's copied rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardHash(Vec<u8>);

impl ShardHash {
    /// Wrap raw digest bytes; an empty hash is rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidInput("shard hash must not be empty".to_string()));
        }
        Ok(Self(bytes))
    }

    /// Digest output is never empty.
    pub(crate) fn from_digest(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidInput(format!("invalid shard hash hex: {}", e)))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for ShardHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// =============================================================================
// SHARD RECORD
// =============================================================================

/// One shard-creation run and, once completed, the historical partition it
/// produced.
///
/// The same record backs both the run state (while in progress) and the
/// registry entry (once `state == Completed`). Completed records are
/// immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub height_range: HeightRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_hash: Option<ShardHash>,
    pub state: MigrateState,
    /// Last state reached through a successful phase; kept when the run fails
    /// so an operator can restart from the first unfinished phase.
    pub last_completed_state: MigrateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shard {
    /// A fresh run record in `Init`.
    pub fn new_run(height_range: HeightRange) -> Self {
        let now = Utc::now();
        Self {
            id: ShardId::for_boundary(&height_range),
            height_range,
            shard_hash: None,
            state: MigrateState::Init,
            last_completed_state: MigrateState::Init,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == MigrateState::Completed
    }

    /// State the run would continue from: the recorded state, or for a
    /// failed run the last state a phase completed.
    pub fn resume_state(&self) -> MigrateState {
        if self.state == MigrateState::Failed {
            self.last_completed_state
        } else {
            self.state
        }
    }

    /// Snapshot block height: the first height that stays in the main store.
    pub fn snapshot_height(&self) -> i64 {
        self.height_range.to
    }
}
