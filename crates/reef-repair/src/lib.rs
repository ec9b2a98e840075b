//! Repair job coordination for Reef.
//!
//! This crate provides:
//!
//! - [`RepairRegistry`]: per-shard registry issuing job identities, tracking
//!   their lifecycle, and answering status and completion queries.
//! - [`ConcurrencyGate`]: memory-weighted admission gate shared by every
//!   range repair on a shard.
//! - [`CompletionSignal`]: broadcast fired whenever a job stops running.
//! - [`RepairJob`] with two variants: [`UserRequestedRepair`] and
//!   [`DataSyncRepair`].
//! - [`RepairConfig`]: TOML configuration.

pub mod config;
pub mod data_sync;
pub mod error;
pub mod gate;
pub mod hierarchy;
pub mod job;
pub mod record;
pub mod registry;
pub mod signal;
pub mod status;
pub mod user_requested;

pub use config::RepairConfig;
pub use data_sync::{DataSyncRepair, NodeOpsHandle};
pub use error::RepairError;
pub use gate::{ConcurrencyGate, GatePermit, GateStats, MAX_REPAIR_MEMORY_PER_RANGE};
pub use hierarchy::{DetachedTasks, TaskHierarchy};
pub use job::{RangeRepairer, RangeRequest, RepairJob};
pub use record::{JobOrigin, RepairProgress, RepairRecord, ReplicaPlan};
pub use registry::{JobContext, RepairRegistry};
pub use signal::{CompletionSignal, CompletionWaiter};
pub use status::StatusTable;
pub use user_requested::{RepairRequest, UserRequestedRepair};
