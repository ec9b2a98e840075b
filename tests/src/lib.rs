//! Shared test harness for Reef repair integration tests.
//!
//! Provides [`TestShard`], a repair registry wired to a [`ScriptedRepairer`]
//! whose per-range behavior is chosen by the test, plus topology builders
//! and a [`RecordingHierarchy`] that captures task-tree callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reef_repair::{
    DataSyncRepair, NodeOpsHandle, RangeRepairer, RangeRequest, RepairConfig, RepairError,
    RepairRegistry, RepairRequest, TaskHierarchy, UserRequestedRepair,
};
use reef_types::*;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

pub use reef_repair::MAX_REPAIR_MEMORY_PER_RANGE;

pub const MIB: u64 = 1024 * 1024;

/// Install a console subscriber once per test binary.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &RepairConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// =========================================================================
// Topology
// =========================================================================

pub fn node_id(n: u8) -> NodeId {
    NodeId::from([n; 32])
}

/// The `i`-th of a set of adjacent ranges.
pub fn range(i: i64) -> TokenRange {
    TokenRange::new(i * 1000, (i + 1) * 1000)
}

pub fn ranges(n: i64) -> Vec<TokenRange> {
    (0..n).map(range).collect()
}

/// `nodes` replicas per range, node 1 local, nodes split evenly across two
/// datacenters.
pub fn ring(ranges: &[TokenRange], nodes: u8, version: u64) -> Arc<ReplicaSnapshot> {
    let mut snap = ReplicaSnapshot::new(node_id(1), version);
    for r in ranges {
        let replicas = (1..=nodes)
            .map(|n| Replica {
                node_id: node_id(n),
                host: format!("10.0.{}.{n}", n % 2),
                datacenter: format!("dc{}", n % 2),
            })
            .collect();
        snap = snap.with_range(*r, replicas);
    }
    Arc::new(snap)
}

/// Every range repaired against `peers`.
pub fn neighbor_map(ranges: &[TokenRange], peers: &[u8]) -> HashMap<TokenRange, RepairNeighbors> {
    let peers: Vec<NodeId> = peers.iter().map(|n| node_id(*n)).collect();
    ranges
        .iter()
        .map(|r| (*r, RepairNeighbors::new(peers.clone())))
        .collect()
}

// =========================================================================
// Scripted range repairer
// =========================================================================

/// What a range does when repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeScript {
    Succeed,
    Fail,
    /// Block until [`ScriptedRepairer::release`] hands out a permit.
    Hold,
}

/// Range repairer with per-range scripted outcomes.
///
/// Tracks the order ranges started in and the peak number of ranges in
/// flight at once.
pub struct ScriptedRepairer {
    scripts: Mutex<HashMap<TokenRange, RangeScript>>,
    memory: u64,
    release: Semaphore,
    started: Mutex<Vec<TokenRange>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRepairer {
    /// Every range succeeds and estimates one full per-range budget.
    pub fn new() -> Arc<Self> {
        Self::with_memory(MAX_REPAIR_MEMORY_PER_RANGE)
    }

    pub fn with_memory(memory: u64) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            memory,
            release: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, ranges: &[TokenRange], script: RangeScript) {
        let mut scripts = self.scripts.lock().unwrap();
        for r in ranges {
            scripts.insert(*r, script);
        }
    }

    /// Let `n` held ranges finish.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    /// Ranges in the order they began repairing.
    pub fn started(&self) -> Vec<TokenRange> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeRepairer for ScriptedRepairer {
    fn estimated_memory(&self, _request: &RangeRequest) -> u64 {
        self.memory
    }

    async fn repair_range(&self, request: RangeRequest) -> Result<(), RepairError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.range)
            .copied()
            .unwrap_or(RangeScript::Succeed);
        self.started.lock().unwrap().push(request.range);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if script == RangeScript::Hold {
            self.release.acquire().await.unwrap().forget();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match script {
            RangeScript::Fail => Err(RepairError::RangeFailed {
                range: request.range,
                reason: "injected failure".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// =========================================================================
// Recording hierarchy
// =========================================================================

/// Task-tree event captured by [`RecordingHierarchy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Registered(TaskId, String),
    Started(TaskId),
    Finished(TaskId, RepairStatus),
    Aborted(TaskId),
}

#[derive(Default)]
pub struct RecordingHierarchy {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingHierarchy {
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one task, in order.
    pub fn events_for(&self, task: TaskId) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                TaskEvent::Registered(t, _)
                | TaskEvent::Started(t)
                | TaskEvent::Finished(t, _)
                | TaskEvent::Aborted(t) => *t == task,
            })
            .collect()
    }
}

impl TaskHierarchy for RecordingHierarchy {
    fn register(&self, task: &TaskInfo, label: &JobLabel) {
        self.events
            .lock()
            .unwrap()
            .push(TaskEvent::Registered(task.id, label.kind.clone()));
    }

    fn task_started(&self, task: &TaskInfo) {
        self.events.lock().unwrap().push(TaskEvent::Started(task.id));
    }

    fn task_finished(&self, task: &TaskInfo, status: RepairStatus) {
        self.events
            .lock()
            .unwrap()
            .push(TaskEvent::Finished(task.id, status));
    }

    fn task_aborted(&self, task: &TaskInfo) {
        self.events.lock().unwrap().push(TaskEvent::Aborted(task.id));
    }
}

// =========================================================================
// Test shard
// =========================================================================

/// One shard's repair registry with a scripted data path.
pub struct TestShard {
    pub registry: Arc<RepairRegistry>,
    pub repairer: Arc<ScriptedRepairer>,
    pub hierarchy: Arc<RecordingHierarchy>,
}

impl TestShard {
    /// A shard whose gate holds `max_memory` bytes.
    pub fn new(max_memory: u64) -> Self {
        Self::with_repairer(max_memory, ScriptedRepairer::new())
    }

    pub fn with_repairer(max_memory: u64, repairer: Arc<ScriptedRepairer>) -> Self {
        let config = RepairConfig::from_toml(&format!(
            "[repair]\nmax_memory = \"{}MB\"\n\n[log]\nlevel = \"debug\"\n",
            max_memory / MIB
        ))
        .unwrap();
        init_tracing(&config);

        let hierarchy = Arc::new(RecordingHierarchy::default());
        let registry = RepairRegistry::from_config(0, &config, hierarchy.clone());
        Self {
            registry,
            repairer,
            hierarchy,
        }
    }

    /// A user-requested job over `ranges` against a three-node ring.
    pub fn user_job(&self, keyspace: &str, ranges: &[TokenRange]) -> Arc<UserRequestedRepair> {
        Arc::new(UserRequestedRepair::new(
            self.registry.new_id(),
            RepairRequest {
                keyspace: keyspace.to_string(),
                tables: vec!["events".to_string()],
                ranges: ranges.to_vec(),
                ..RepairRequest::default()
            },
            ring(ranges, 3, 1),
            self.repairer.clone(),
        ))
    }

    /// A data-sync job over `ranges`, each repaired against nodes 2 and 3.
    pub fn data_sync_job(
        &self,
        ranges: &[TokenRange],
        reason: StreamReason,
        ops: Option<NodeOpsHandle>,
    ) -> Arc<DataSyncRepair> {
        Arc::new(DataSyncRepair::new(
            self.registry.new_id(),
            "system_distributed",
            ranges.to_vec(),
            neighbor_map(ranges, &[2, 3]),
            reason,
            ops,
            self.repairer.clone(),
        ))
    }

    /// Run `job` on its own task.
    pub fn spawn<J>(&self, job: Arc<J>) -> tokio::task::JoinHandle<Result<(), RepairError>>
    where
        J: reef_repair::RepairJob + 'static,
    {
        let registry = self.registry.clone();
        tokio::spawn(async move { job.execute(&registry).await })
    }

    /// Every acquired gate byte has been released.
    pub fn assert_gate_balanced(&self) {
        let stats = self.registry.gate().stats();
        assert_eq!(
            stats.acquired_bytes, stats.released_bytes,
            "gate permits leaked"
        );
        assert_eq!(
            self.registry.gate().available_bytes(),
            self.registry.gate().capacity_bytes()
        );
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Whether every id carries its own task identity.
pub fn distinct(ids: &[RepairJobId]) -> bool {
    ids.iter().map(|i| i.task.id).collect::<HashSet<_>>().len() == ids.len()
}
