//! # strata-core
//!
//! Core types, traits, and abstractions for ledger shard migration.
//!
//! This crate provides the shard record and migration state machine, the
//! per-phase parameter types, shard content hashing, and the storage traits
//! the migration orchestrator is written against.

pub mod defaults;
pub mod error;
pub mod hash;
pub mod logging;
pub mod models;
pub mod params;
pub mod schema_version;
pub mod tables;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use hash::ShardHasher;
pub use models::{HeightRange, MigrateState, Shard, ShardHash, ShardId};
pub use params::{
    CopyParams, DeleteParams, FinalizeParams, IndexParams, PhaseCommand, RelinkParams,
    TableBatchParams,
};
pub use schema_version::{plan_schema_step, ShardSchemaVersion};
pub use tables::{DataPhase, LedgerTable};
pub use traits::*;
