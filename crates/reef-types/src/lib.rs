//! Shared types and identifiers for Reef.
//!
//! This crate defines the value types used across the Reef workspace:
//! identifiers ([`NodeId`], [`TaskId`], [`TaskInfo`], [`RepairJobId`]),
//! the repair status contract ([`RepairStatus`]), token ranges
//! ([`TokenRange`]), streaming reasons ([`StreamReason`]), job labels
//! ([`JobLabel`]) and the captured replica topology ([`topology`]).

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub mod topology;

pub use topology::{NeighborFilter, RepairNeighbors, Replica, ReplicaSnapshot};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Identifier for a cluster node.
    NodeId
);

define_id!(
    /// Identifier of a task in the generic task hierarchy.
    TaskId
);

impl TaskId {
    /// Generate a fresh random task identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// A task identifier together with the execution context (shard) that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier in the task hierarchy.
    pub id: TaskId,
    /// Index of the owning shard.
    pub shard: u32,
}

/// Identity of one repair job.
///
/// Issued by the registry of the owning shard and never reused. The sequence
/// number is what external pollers use to query status; the task id links
/// the job to the task hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepairJobId {
    /// Strictly increasing per-shard sequence number, starting at 1.
    pub sequence_number: u64,
    /// Task identity and owning shard.
    pub task: TaskInfo,
}

impl RepairJobId {
    /// Shortcut for `self.task.id`.
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }
}

impl fmt::Display for RepairJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repair[{}]@shard{}", self.sequence_number, self.task.shard)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a repair job as seen by pollers.
///
/// Only `Running` and `Failed` are ever stored. `Successful` and `NotExist`
/// are inferred from the absence of an entry and the highest issued id.
/// Variant order is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairStatus {
    /// The job has started and not yet finished.
    Running,
    /// The job finished without error.
    Successful,
    /// The job finished with an error.
    Failed,
    /// No job with this id was ever issued.
    NotExist,
}

impl RepairStatus {
    /// Whether the job has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
            Self::NotExist => "NOT_EXIST",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Token ranges and streaming
// ---------------------------------------------------------------------------

/// A contiguous slice of the token ring: `(start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TokenRange {
    /// Exclusive lower bound.
    pub start: i64,
    /// Inclusive upper bound.
    pub end: i64,
}

impl TokenRange {
    /// Create a range `(start, end]`.
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Whether the range wraps around the end of the ring.
    pub fn wraps(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `token` falls inside the range.
    pub fn contains(&self, token: i64) -> bool {
        if self.wraps() {
            token > self.start || token <= self.end
        } else {
            token > self.start && token <= self.end
        }
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}

/// Why data is being streamed. Topology-change repairs carry the reason of the
/// node operation that raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamReason {
    /// Operator-requested repair.
    Repair,
    /// A new node joins the ring.
    Bootstrap,
    /// A node leaves the ring gracefully.
    Decommission,
    /// A dead node is removed from the ring.
    RemoveNode,
    /// A node re-streams its own ranges.
    Rebuild,
    /// A dead node is replaced by a new one.
    Replace,
}

impl fmt::Display for StreamReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Repair => "repair",
            Self::Bootstrap => "bootstrap",
            Self::Decommission => "decommission",
            Self::RemoveNode => "removenode",
            Self::Rebuild => "rebuild",
            Self::Replace => "replace",
        };
        f.write_str(s)
    }
}

/// Classification of a job for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLabel {
    /// Target keyspace.
    pub keyspace: String,
    /// Target table, empty when the job covers several.
    pub table: String,
    /// Job type, e.g. `"user_requested"` or `"data_sync"`.
    pub kind: String,
    /// Free-form entity the job acts on.
    pub entity: String,
}

impl JobLabel {
    /// Label for a job covering a whole keyspace.
    pub fn new(keyspace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Set the entity field.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = entity.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
