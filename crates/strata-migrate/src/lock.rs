//! Run exclusivity, chain write gating and cancellation.
//!
//! The hot paths (`CancelHandle::is_cancelled`) are lock-free atomics; the
//! run lock and the chain write gate are owned tokio guards so a
//! [`RunHandle`] can hold its lock across await points and threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::info;

use strata_core::{Error, HeightRange, Result, ShardId};

/// In-process exclusive lock for the lifetime of a shard run.
#[derive(Clone, Default)]
pub struct RunLock {
    inner: Arc<Mutex<()>>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Result<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().map_err(|_| {
            Error::RunInProgress("a shard run is already attached in this process".to_string())
        })
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Coordination between block acceptance and the phases that rewrite
/// block and transaction tables.
///
/// Block acceptance holds a shared permit per block; the orchestrator holds
/// the exclusive permit while copy, index or delete batches run.
#[derive(Clone, Default)]
pub struct ChainWriteGate {
    inner: Arc<RwLock<()>>,
}

impl ChainWriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared permit for accepting one block. Waits while a chain phase runs.
    pub async fn block_acceptance(&self) -> OwnedRwLockReadGuard<()> {
        self.inner.clone().read_owned().await
    }

    /// Shared permit if no chain phase is running right now.
    pub fn try_block_acceptance(&self) -> Option<OwnedRwLockReadGuard<()>> {
        self.inner.clone().try_read_owned().ok()
    }

    pub(crate) async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.clone().write_owned().await
    }
}

/// Cooperative cancellation observed at batch boundaries.
///
/// Once cancelled, every later phase call on the same run handle returns a
/// partial result without running a batch. Attach a new handle to continue.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!(
                subsystem = "migrate",
                component = "lock",
                op = "cancel",
                "Shard run cancellation requested"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// An attached shard run.
///
/// Every orchestrator call takes the handle instead of looking up a global
/// current run. Dropping the handle releases the run lock; the durable run
/// state stays in the store.
pub struct RunHandle {
    shard_id: ShardId,
    height_range: HeightRange,
    cancel: CancelHandle,
    _guard: OwnedMutexGuard<()>,
}

impl RunHandle {
    pub(crate) fn new(
        shard_id: ShardId,
        height_range: HeightRange,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            shard_id,
            height_range,
            cancel: CancelHandle::new(),
            _guard: guard,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn height_range(&self) -> HeightRange {
        self.height_range
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("shard_id", &self.shard_id)
            .field("height_range", &self.height_range)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
