//! Per-job aggregate state shared by the registry and range workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reef_types::{RepairJobId, RepairNeighbors, ReplicaSnapshot, StreamReason, TokenRange};

/// Which part of the system raised a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    /// Requested by an operator.
    UserRequested,
    /// Raised by a membership-changing node operation.
    TopologyChange,
}

/// Where a job gets its replica sets from.
#[derive(Debug, Clone)]
pub enum ReplicaPlan {
    /// Resolved from a topology snapshot captured when the job was built.
    Snapshot(Arc<ReplicaSnapshot>),
    /// Precomputed by the node operation that raised the job.
    Neighbors(Arc<HashMap<TokenRange, RepairNeighbors>>),
}

/// Point-in-time progress of one job, in ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairProgress {
    /// Ranges repaired successfully (or skipped because they had no peers).
    pub finished: u64,
    /// Ranges that failed.
    pub failed: u64,
    /// Ranges assigned to the job.
    pub total: u64,
}

impl RepairProgress {
    /// Unit the counters are expressed in.
    pub const UNITS: &'static str = "ranges";

    /// Fraction of assigned ranges that finished, in `[0, 1]`.
    ///
    /// A job with no ranges counts as complete.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.finished as f32 / self.total as f32
        }
    }
}

/// Mutable aggregate state of one repair job.
///
/// Held behind an `Arc` by the registry and by every range worker of the
/// job. Counters are atomics so workers update them without coordination.
#[derive(Debug)]
pub struct RepairRecord {
    id: RepairJobId,
    origin: JobOrigin,
    reason: StreamReason,
    keyspace: String,
    tables: Vec<String>,
    ranges: Vec<TokenRange>,
    replicas: ReplicaPlan,
    ranges_finished: AtomicU64,
    ranges_failed: AtomicU64,
    /// Gate bytes currently held by this job's workers.
    gate_bytes: AtomicU64,
}

impl RepairRecord {
    /// Create a record with zeroed counters.
    pub fn new(
        id: RepairJobId,
        origin: JobOrigin,
        reason: StreamReason,
        keyspace: impl Into<String>,
        tables: Vec<String>,
        ranges: Vec<TokenRange>,
        replicas: ReplicaPlan,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            origin,
            reason,
            keyspace: keyspace.into(),
            tables,
            ranges,
            replicas,
            ranges_finished: AtomicU64::new(0),
            ranges_failed: AtomicU64::new(0),
            gate_bytes: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> RepairJobId {
        self.id
    }

    pub fn origin(&self) -> JobOrigin {
        self.origin
    }

    pub fn reason(&self) -> StreamReason {
        self.reason
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn ranges(&self) -> &[TokenRange] {
        &self.ranges
    }

    pub fn replicas(&self) -> &ReplicaPlan {
        &self.replicas
    }

    /// Count one range as done.
    pub fn range_finished(&self) {
        self.ranges_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one range as failed.
    pub fn range_failed(&self) {
        self.ranges_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Note that a worker of this job took `bytes` from the gate.
    pub fn gate_acquired(&self, bytes: u64) {
        self.gate_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Note that a worker of this job gave `bytes` back to the gate.
    pub fn gate_released(&self, bytes: u64) {
        self.gate_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Gate bytes currently held by this job.
    pub fn gate_bytes(&self) -> u64 {
        self.gate_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of the progress counters.
    pub fn progress(&self) -> RepairProgress {
        RepairProgress {
            finished: self.ranges_finished.load(Ordering::Relaxed),
            failed: self.ranges_failed.load(Ordering::Relaxed),
            total: self.ranges.len() as u64,
        }
    }
}
