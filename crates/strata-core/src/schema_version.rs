//! Ordered shard schema versions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::MigrateState;

/// Schema levels a shard store is brought through, in order.
///
/// `Init` creates bare tables suited to unindexed bulk inserts; `Full` adds
/// keys, foreign keys and indexes on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardSchemaVersion {
    Init,
    Full,
}

impl ShardSchemaVersion {
    pub const ALL: [ShardSchemaVersion; 2] = [ShardSchemaVersion::Init, ShardSchemaVersion::Full];

    /// Numeric version stored in the shard's bookkeeping table.
    pub fn number(&self) -> i32 {
        match self {
            ShardSchemaVersion::Init => 1,
            ShardSchemaVersion::Full => 2,
        }
    }

    pub fn from_number(n: i32) -> Option<Self> {
        Self::ALL.iter().find(|v| v.number() == n).copied()
    }

    /// Version that must already be applied, if any.
    pub fn requires(&self) -> Option<ShardSchemaVersion> {
        match self {
            ShardSchemaVersion::Init => None,
            ShardSchemaVersion::Full => Some(ShardSchemaVersion::Init),
        }
    }

    /// Run state this version moves the run out of.
    pub fn required_state(&self) -> MigrateState {
        match self {
            ShardSchemaVersion::Init => MigrateState::Init,
            ShardSchemaVersion::Full => MigrateState::ShardSchemaCreated,
        }
    }

    /// Run state recorded once this version is applied.
    pub fn target_state(&self) -> MigrateState {
        match self {
            ShardSchemaVersion::Init => MigrateState::ShardSchemaCreated,
            ShardSchemaVersion::Full => MigrateState::ShardSchemaFull,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardSchemaVersion::Init => "init",
            ShardSchemaVersion::Full => "full",
        }
    }
}

impl fmt::Display for ShardSchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardSchemaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(ShardSchemaVersion::Init),
            "full" => Ok(ShardSchemaVersion::Full),
            other => Err(Error::InvalidInput(format!(
                "unknown shard schema version: {}",
                other
            ))),
        }
    }
}

/// Decide what applying `requested` does given the version already present.
///
/// Returns `Ok(false)` when the request is a no-op, `Ok(true)` when DDL must
/// run, and a `Schema` error when a prerequisite version is missing.
pub fn plan_schema_step(
    current: Option<ShardSchemaVersion>,
    requested: ShardSchemaVersion,
) -> Result<bool> {
    if current.is_some_and(|c| c >= requested) {
        return Ok(false);
    }
    match requested.requires() {
        Some(needed) if current != Some(needed) => Err(Error::Schema(format!(
            "shard schema '{}' requires '{}' to be applied first (current: {})",
            requested,
            needed,
            current.map(|c| c.as_str()).unwrap_or("none")
        ))),
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_ordered() {
        assert!(ShardSchemaVersion::Init < ShardSchemaVersion::Full);
        assert_eq!(ShardSchemaVersion::from_number(1), Some(ShardSchemaVersion::Init));
        assert_eq!(ShardSchemaVersion::from_number(2), Some(ShardSchemaVersion::Full));
        assert_eq!(ShardSchemaVersion::from_number(3), None);
    }

    #[test]
    fn test_versions_map_onto_states() {
        assert_eq!(
            ShardSchemaVersion::Init.required_state().next(),
            Some(ShardSchemaVersion::Init.target_state())
        );
        assert_eq!(
            ShardSchemaVersion::Init.target_state(),
            ShardSchemaVersion::Full.required_state()
        );
    }

    #[test]
    fn test_init_twice_is_noop() {
        assert!(plan_schema_step(None, ShardSchemaVersion::Init).unwrap());
        assert!(!plan_schema_step(Some(ShardSchemaVersion::Init), ShardSchemaVersion::Init).unwrap());
        assert!(!plan_schema_step(Some(ShardSchemaVersion::Full), ShardSchemaVersion::Init).unwrap());
    }

    #[test]
    fn test_full_requires_init() {
        let err = plan_schema_step(None, ShardSchemaVersion::Full).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert!(plan_schema_step(Some(ShardSchemaVersion::Init), ShardSchemaVersion::Full).unwrap());
        assert!(!plan_schema_step(Some(ShardSchemaVersion::Full), ShardSchemaVersion::Full).unwrap());
    }

    #[test]
    fn test_parse() {
        assert_eq!("init".parse::<ShardSchemaVersion>().unwrap(), ShardSchemaVersion::Init);
        assert_eq!("full".parse::<ShardSchemaVersion>().unwrap(), ShardSchemaVersion::Full);
        assert!("constraints".parse::<ShardSchemaVersion>().is_err());
    }
}
