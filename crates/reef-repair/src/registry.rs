//! Repair job registry for one execution context (shard).
//!
//! [`RepairRegistry`] issues job identities, tracks every job from start to
//! its terminal state, owns the shard's [`ConcurrencyGate`], and answers
//! status and completion queries.
//!
//! Successful jobs leave no trace in the status table: a sequence number
//! without an entry is `Successful` if it was issued and `NotExist`
//! otherwise. Failed jobs stay in the table, with their records, until the
//! registry is dropped.
//!
//! All bookkeeping sits behind one mutex that is never held across an await,
//! so the registry's invariants hold between any two suspension points.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use reef_types::{RepairJobId, RepairStatus, StreamReason, TaskId, TaskInfo};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RepairConfig;
use crate::error::RepairError;
use crate::gate::ConcurrencyGate;
use crate::hierarchy::TaskHierarchy;
use crate::record::{JobOrigin, RepairProgress, RepairRecord};
use crate::signal::CompletionSignal;
use crate::status::StatusTable;

/// Identity and abort token handed to a job body by [`RepairRegistry::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    id: RepairJobId,
    abort: CancellationToken,
}

impl JobContext {
    pub fn id(&self) -> RepairJobId {
        self.id
    }

    /// The job's cooperative cancellation token.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Whether abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Fail with [`RepairError::Aborted`] if abort has been requested.
    pub fn check_aborted(&self) -> Result<(), RepairError> {
        if self.is_aborted() {
            Err(RepairError::Aborted(self.id))
        } else {
            Ok(())
        }
    }
}

struct RegistryState {
    table: StatusTable,
    records: HashMap<u64, Arc<RepairRecord>>,
    /// Issued but not yet started.
    requested: HashSet<TaskId>,
    /// Started and not yet done, with each job's abort token.
    pending: HashMap<TaskId, CancellationToken>,
    /// Aborted while still only requested.
    aborted_pending: HashSet<TaskId>,
}

/// Registry of repair jobs for one shard.
pub struct RepairRegistry {
    shard: u32,
    state: Mutex<RegistryState>,
    gate: ConcurrencyGate,
    completion: CompletionSignal,
    hierarchy: Arc<dyn TaskHierarchy>,
    shutting_down: AtomicBool,
}

impl RepairRegistry {
    /// Create a registry for `shard` whose gate holds `max_repair_memory` bytes.
    pub fn new(shard: u32, max_repair_memory: u64, hierarchy: Arc<dyn TaskHierarchy>) -> Arc<Self> {
        info!(shard, max_repair_memory, "repair registry started");
        Arc::new(Self {
            shard,
            state: Mutex::new(RegistryState {
                table: StatusTable::new(),
                records: HashMap::new(),
                requested: HashSet::new(),
                pending: HashMap::new(),
                aborted_pending: HashSet::new(),
            }),
            gate: ConcurrencyGate::new(max_repair_memory),
            completion: CompletionSignal::new(),
            hierarchy,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Create a registry sized from configuration.
    pub fn from_config(
        shard: u32,
        config: &RepairConfig,
        hierarchy: Arc<dyn TaskHierarchy>,
    ) -> Arc<Self> {
        Self::new(shard, config.max_repair_memory_bytes(), hierarchy)
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("repair registry lock poisoned")
    }

    /// The shard this registry belongs to.
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// The shard-wide gate range workers acquire permits from.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// The task hierarchy jobs report to.
    pub fn hierarchy(&self) -> &Arc<dyn TaskHierarchy> {
        &self.hierarchy
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Issue a new job identity.
    pub fn new_id(&self) -> RepairJobId {
        let task = TaskInfo {
            id: TaskId::random(),
            shard: self.shard,
        };
        let mut state = self.state();
        let sequence_number = state.table.issue();
        state.requested.insert(task.id);
        RepairJobId {
            sequence_number,
            task,
        }
    }

    /// Mark `id` as running and return its abort token.
    ///
    /// Must be called exactly once per id, before the job body runs. If the
    /// id was aborted while only requested, the token comes back already
    /// cancelled.
    pub fn start(&self, id: RepairJobId) -> CancellationToken {
        let token = CancellationToken::new();
        {
            let mut state = self.state();
            debug_assert!(
                !state.pending.contains_key(&id.task.id),
                "{id} started twice"
            );
            state.requested.remove(&id.task.id);
            if state.aborted_pending.remove(&id.task.id) {
                token.cancel();
            }
            state.pending.insert(id.task.id, token.clone());
            state.table.mark_running(id.sequence_number);
        }
        debug!(%id, aborted = token.is_cancelled(), "repair job started");
        self.hierarchy.task_started(&id.task);
        token
    }

    /// Move `id` out of the running state.
    ///
    /// On success the status entry and the job record are dropped; on failure
    /// both are kept. Wakes every completion waiter. Does nothing if `id` is
    /// not currently running.
    pub fn done(&self, id: RepairJobId, succeeded: bool) {
        let status = {
            let mut state = self.state();
            if state.pending.remove(&id.task.id).is_none() {
                debug!(%id, "done called for a job that is not running");
                return;
            }
            if succeeded {
                state.table.clear(id.sequence_number);
                state.records.remove(&id.sequence_number);
                RepairStatus::Successful
            } else {
                state.table.mark_failed(id.sequence_number);
                RepairStatus::Failed
            }
        };

        if succeeded {
            info!(%id, "repair job finished");
        } else {
            warn!(%id, "repair job failed");
        }
        self.hierarchy.task_finished(&id.task, status);
        self.completion.broadcast();
    }

    /// Run `body` as job `id`.
    ///
    /// Starts the job, runs the body with its [`JobContext`], and marks it
    /// done on every exit path: normal return, error, panic, or the returned
    /// future being dropped. A body error marks the job failed and is
    /// returned unchanged.
    pub async fn run<F, Fut, T>(&self, id: RepairJobId, body: F) -> Result<T, RepairError>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T, RepairError>>,
    {
        if let Err(e) = self.check_shutdown() {
            self.reject(id);
            return Err(e);
        }
        let abort = self.start(id);
        let mut guard = DoneGuard {
            registry: self,
            id,
            succeeded: false,
        };
        let result = body(JobContext { id, abort }).await;
        guard.succeeded = result.is_ok();
        drop(guard);
        result
    }

    /// Record `id` as failed without ever running it.
    ///
    /// Used when admission is refused, so pollers never read a rejected job
    /// as successful.
    fn reject(&self, id: RepairJobId) {
        {
            let mut state = self.state();
            state.requested.remove(&id.task.id);
            state.aborted_pending.remove(&id.task.id);
            state.table.mark_failed(id.sequence_number);
        }
        warn!(%id, "repair job rejected: registry is shutting down");
        self.hierarchy.task_finished(&id.task, RepairStatus::Failed);
        self.completion.broadcast();
    }

    /// Forget an id that was issued but will never be started.
    ///
    /// Its status follows the inference rule from then on. Does nothing for
    /// ids that have already started.
    pub fn discard(&self, id: RepairJobId) {
        let mut state = self.state();
        state.requested.remove(&id.task.id);
        state.aborted_pending.remove(&id.task.id);
    }

    /// Number of ids issued but not yet started, aborted or not.
    pub fn unstarted_count(&self) -> usize {
        let state = self.state();
        state.requested.len() + state.aborted_pending.len()
    }

    /// Fail if the registry no longer admits new jobs.
    pub fn check_shutdown(&self) -> Result<(), RepairError> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(RepairError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Stop admitting jobs, close the gate, and abort everything in flight.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(shard = self.shard, "repair registry shutting down");
        self.gate.close();
        self.abort_all();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Status of the job with sequence number `id`.
    pub fn get(&self, id: u64) -> RepairStatus {
        self.state().table.lookup(id)
    }

    /// Sequence numbers of running jobs, ascending.
    pub fn active(&self) -> Vec<u64> {
        self.state().table.running().collect()
    }

    /// Number of running jobs.
    pub fn running_count(&self) -> usize {
        self.state().table.running_count()
    }

    /// Number of failed jobs still retained.
    pub fn failed_count(&self) -> usize {
        self.state().table.failed_count()
    }

    /// Wait until job `id` leaves the running state or `deadline` passes.
    ///
    /// Returns `NotExist` at once for ids that were never issued. A timeout
    /// only ends the wait; the job keeps running.
    pub async fn await_completion(
        &self,
        id: u64,
        deadline: Instant,
    ) -> Result<RepairStatus, RepairError> {
        let mut waiter = self.completion.subscribe();
        let wait = async {
            loop {
                match self.get(id) {
                    RepairStatus::Running => waiter.changed().await,
                    status => return status,
                }
            }
        };
        tokio::time::timeout_at(deadline, wait)
            .await
            .map_err(|_| RepairError::Timeout { id })
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    /// Request abort of every job on this shard.
    ///
    /// Running jobs have their tokens cancelled and the abort is propagated to
    /// the task hierarchy; jobs that are issued but not started are remembered
    /// so they fail as soon as they start. Cancellation is cooperative.
    pub fn abort_all(&self) {
        let (running, aborted_pending) = {
            let mut state = self.state();
            let running: Vec<TaskId> = state
                .pending
                .iter()
                .map(|(task, token)| {
                    token.cancel();
                    *task
                })
                .collect();
            let requested: Vec<TaskId> = state.requested.drain().collect();
            state.aborted_pending.extend(requested);
            (running, state.aborted_pending.len())
        };

        for id in &running {
            self.hierarchy.task_aborted(&TaskInfo {
                id: *id,
                shard: self.shard,
            });
        }
        info!(
            shard = self.shard,
            running = running.len(),
            aborted_pending,
            "aborted all repair jobs"
        );
    }

    /// Whether `task` was aborted before it started.
    pub fn is_aborted(&self, task: &TaskId) -> bool {
        self.state().aborted_pending.contains(task)
    }

    // -----------------------------------------------------------------------
    // Job records
    // -----------------------------------------------------------------------

    /// Attach the record of job `id`.
    pub fn add_repair_record(&self, id: u64, record: Arc<RepairRecord>) {
        let previous = self.state().records.insert(id, record);
        debug_assert!(previous.is_none(), "record for repair[{id}] added twice");
    }

    /// Detach the record of job `id`.
    pub fn remove_repair_record(&self, id: u64) -> Option<Arc<RepairRecord>> {
        self.state().records.remove(&id)
    }

    /// The record of job `id`, if it is running or failed.
    pub fn repair_record(&self, id: u64) -> Option<Arc<RepairRecord>> {
        self.state().records.get(&id).cloned()
    }

    /// Progress of job `id`, for generic task polling.
    pub fn progress(&self, id: u64) -> Option<RepairProgress> {
        self.repair_record(id).map(|r| r.progress())
    }

    /// Aggregate progress of running topology-change jobs raised for `reason`.
    ///
    /// Returns finished ranges over assigned ranges across all matching jobs,
    /// or 1.0 if nothing matches.
    pub fn report_progress(&self, reason: StreamReason) -> f32 {
        let state = self.state();
        let mut finished = 0u64;
        let mut total = 0u64;
        for (seq, record) in &state.records {
            if record.origin() != JobOrigin::TopologyChange || record.reason() != reason {
                continue;
            }
            if state.table.lookup(*seq) != RepairStatus::Running {
                continue;
            }
            let progress = record.progress();
            finished += progress.finished;
            total += progress.total;
        }
        if total == 0 {
            1.0
        } else {
            finished as f32 / total as f32
        }
    }
}

/// Calls [`RepairRegistry::done`] when dropped.
struct DoneGuard<'a> {
    registry: &'a RepairRegistry,
    id: RepairJobId,
    succeeded: bool,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.registry.done(self.id, self.succeeded);
    }
}
