//! # strata-migrate
//!
//! Moves a closed range of historical ledger heights out of the main store
//! into its own shard store.
//!
//! A run walks a fixed state sequence. Each phase call is re-entrant and
//! works in bounded batches, so a run can be stopped and resumed at any
//! batch boundary, including across process restarts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_migrate::{MigrationConfig, OrchestratorBuilder};
//! use strata_db::Database;
//!
//! let db = Database::connect("postgres://localhost/strata").await?;
//! let orchestrator = OrchestratorBuilder::from_database(&db)
//!     .with_config(MigrationConfig::from_env())
//!     .build();
//!
//! let run = orchestrator.begin_run(2_000).await?;
//! orchestrator.run_to_completion(&run).await?;
//! ```

pub mod batch_engine;
pub mod config;
pub mod events;
pub mod lock;
pub mod orchestrator;

pub use strata_core::*;

pub use batch_engine::{BatchEngine, EngineSettings, PhaseReport, StopReason};
pub use config::MigrationConfig;
pub use events::MigrationEvent;
pub use lock::{CancelHandle, ChainWriteGate, RunHandle, RunLock};
pub use orchestrator::{MigrationOrchestrator, OrchestratorBuilder, PhaseOutcome};
