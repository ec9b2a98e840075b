//! Memory-weighted admission gate for range repairs.
//!
//! [`ConcurrencyGate`] bounds the memory committed to concurrently running
//! range repairs across every job of a shard. Each range worker acquires
//! permits proportional to its estimated footprint before comparing or
//! transferring data, and gives them back when its [`GatePermit`] drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::error::RepairError;

/// Memory budgeted for a single range repair.
pub const MAX_REPAIR_MEMORY_PER_RANGE: u64 = 32 * 1024 * 1024;

/// Bytes represented by one semaphore permit.
const PERMIT_UNIT_BYTES: u64 = 1024;

/// Bounded, FIFO-fair pool of memory-weighted permits.
///
/// Clonable (`Arc` inside); all clones share one budget.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity_units: u32,
    /// Total bytes ever acquired.
    acquired: Arc<AtomicU64>,
    /// Total bytes ever released.
    released: Arc<AtomicU64>,
}

/// Cumulative gate accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    /// Bytes acquired since the gate was created.
    pub acquired_bytes: u64,
    /// Bytes released since the gate was created.
    pub released_bytes: u64,
}

impl GateStats {
    /// Bytes currently held.
    pub fn held_bytes(&self) -> u64 {
        self.acquired_bytes - self.released_bytes
    }
}

/// Permits held by one unit of work. Released on drop.
#[must_use = "permits are released as soon as the guard is dropped"]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    bytes: u64,
    released: Arc<AtomicU64>,
}

impl GatePermit {
    /// Bytes this permit accounts for, rounded up to whole permit units.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.released.fetch_add(self.bytes, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    /// Create a gate with room for `max_memory` bytes.
    ///
    /// The capacity never drops below one range's budget so that at least one
    /// range can always run.
    pub fn new(max_memory: u64) -> Self {
        let bytes = max_memory.max(MAX_REPAIR_MEMORY_PER_RANGE);
        let capacity_units = (bytes / PERMIT_UNIT_BYTES).min(u64::from(u32::MAX)) as u32;
        debug!(capacity_bytes = bytes, "repair concurrency gate created");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity_units as usize)),
            capacity_units,
            acquired: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait until `bytes` worth of permits are free, then take them.
    ///
    /// Waiters are served in arrival order. A request larger than the whole
    /// gate is clamped to the gate's capacity. Fails only once the gate has
    /// been closed.
    pub async fn acquire(&self, bytes: u64) -> Result<GatePermit, RepairError> {
        let units = self.units_for(bytes);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| RepairError::ShuttingDown)?;
        Ok(self.wrap(permit, units))
    }

    /// Take `bytes` worth of permits if they are free right now.
    ///
    /// Returns `Ok(None)` when the gate is busy.
    pub fn try_acquire(&self, bytes: u64) -> Result<Option<GatePermit>, RepairError> {
        let units = self.units_for(bytes);
        match self.semaphore.clone().try_acquire_many_owned(units) {
            Ok(permit) => Ok(Some(self.wrap(permit, units))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(RepairError::ShuttingDown),
        }
    }

    /// Close the gate: pending and future acquisitions fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Total capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.capacity_units) * PERMIT_UNIT_BYTES
    }

    /// Bytes not currently held by anyone.
    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * PERMIT_UNIT_BYTES
    }

    /// Bytes currently held.
    pub fn held_bytes(&self) -> u64 {
        self.stats().held_bytes()
    }

    /// How many full-budget ranges fit in the gate at once.
    pub fn range_parallelism(&self) -> u64 {
        (self.capacity_bytes() / MAX_REPAIR_MEMORY_PER_RANGE).max(1)
    }

    /// Cumulative acquire/release accounting.
    pub fn stats(&self) -> GateStats {
        // Read `released` first so `held_bytes` can never underflow.
        let released_bytes = self.released.load(Ordering::Acquire);
        let acquired_bytes = self.acquired.load(Ordering::Acquire);
        GateStats {
            acquired_bytes,
            released_bytes,
        }
    }

    fn units_for(&self, bytes: u64) -> u32 {
        let units = bytes.div_ceil(PERMIT_UNIT_BYTES);
        units.clamp(1, u64::from(self.capacity_units)) as u32
    }

    fn wrap(&self, permit: OwnedSemaphorePermit, units: u32) -> GatePermit {
        let bytes = u64::from(units) * PERMIT_UNIT_BYTES;
        self.acquired.fetch_add(bytes, Ordering::AcqRel);
        GatePermit {
            _permit: permit,
            bytes,
            released: self.released.clone(),
        }
    }
}
