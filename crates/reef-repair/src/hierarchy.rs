//! Boundary to the generic task hierarchy that hosts repair jobs.
//!
//! The registry reports lifecycle transitions through [`TaskHierarchy`] and
//! delegates abort propagation to it. The hierarchy itself (parent/child
//! trees, generic polling surface) lives outside this crate.

use reef_types::{JobLabel, RepairStatus, TaskInfo};

/// Callbacks into the task hierarchy.
///
/// Called synchronously from registry bookkeeping, never while a registry
/// lock is held, so implementations may call back into the registry.
pub trait TaskHierarchy: Send + Sync {
    /// A job with this label is about to run under `task`.
    fn register(&self, _task: &TaskInfo, _label: &JobLabel) {}

    /// The job entered the running state.
    fn task_started(&self, _task: &TaskInfo) {}

    /// The job left the running state with a terminal `status`.
    fn task_finished(&self, _task: &TaskInfo, _status: RepairStatus) {}

    /// Abort was requested for a running job.
    fn task_aborted(&self, _task: &TaskInfo) {}
}

/// A hierarchy that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedTasks;

impl TaskHierarchy for DetachedTasks {}
