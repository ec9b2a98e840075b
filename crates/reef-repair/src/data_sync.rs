//! Repair raised by membership-changing node operations.
//!
//! Bootstrap, decommission, removenode, rebuild and replace sync data with
//! repair instead of plain streaming. Such a job arrives with its
//! range→neighbors mapping already computed and is tied to the wider node
//! operation through a [`NodeOpsHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use reef_types::{JobLabel, NodeId, RepairJobId, RepairNeighbors, StreamReason, TokenRange};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::info;

use crate::error::RepairError;
use crate::job::{RangeRepairer, RepairJob, repair_ranges};
use crate::record::{JobOrigin, ReplicaPlan, RepairRecord};
use crate::registry::{JobContext, RepairRegistry};

/// Label kind of topology-change jobs.
pub const DATA_SYNC_KIND: &str = "data_sync";

/// Coordination handle of a multi-node operation.
///
/// Shared by every repair job the operation raises, on every shard. Aborting
/// it aborts all of them.
#[derive(Debug, Clone)]
pub struct NodeOpsHandle {
    ops_id: u64,
    ignore_nodes: Arc<HashSet<NodeId>>,
    abort: CancellationToken,
}

impl NodeOpsHandle {
    /// Create a handle for operation `ops_id`.
    pub fn new(ops_id: u64, ignore_nodes: HashSet<NodeId>) -> Self {
        Self {
            ops_id,
            ignore_nodes: Arc::new(ignore_nodes),
            abort: CancellationToken::new(),
        }
    }

    pub fn ops_id(&self) -> u64 {
        self.ops_id
    }

    /// Nodes the operation declared unreachable.
    pub fn ignore_nodes(&self) -> &HashSet<NodeId> {
        &self.ignore_nodes
    }

    /// Abort the whole operation.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once the operation is aborted.
    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    /// Number of live clones of this handle, including watcher tasks.
    #[cfg(test)]
    pub(crate) fn clones(&self) -> usize {
        Arc::strong_count(&self.ignore_nodes)
    }
}

/// A repair job raised by a topology change.
pub struct DataSyncRepair {
    id: RepairJobId,
    label: JobLabel,
    neighbors: Arc<HashMap<TokenRange, RepairNeighbors>>,
    ranges: Vec<TokenRange>,
    reason: StreamReason,
    ops: Option<NodeOpsHandle>,
    repairer: Arc<dyn RangeRepairer>,
}

impl DataSyncRepair {
    /// Create a job syncing `ranges` of `keyspace`.
    ///
    /// Ranges missing from `neighbors` are repaired against nobody, i.e.
    /// skipped.
    pub fn new(
        id: RepairJobId,
        keyspace: impl Into<String>,
        ranges: Vec<TokenRange>,
        neighbors: HashMap<TokenRange, RepairNeighbors>,
        reason: StreamReason,
        ops: Option<NodeOpsHandle>,
        repairer: Arc<dyn RangeRepairer>,
    ) -> Self {
        let label = JobLabel::new(keyspace, DATA_SYNC_KIND).with_entity(reason.to_string());
        Self {
            id,
            label,
            neighbors: Arc::new(neighbors),
            ranges,
            reason,
            ops,
            repairer,
        }
    }

    pub fn reason(&self) -> StreamReason {
        self.reason
    }

    fn plan(&self) -> Vec<(TokenRange, RepairNeighbors)> {
        let ignore = self.ops.as_ref().map(|ops| ops.ignore_nodes());
        self.ranges
            .iter()
            .map(|range| {
                let mut neighbors = self.neighbors.get(range).cloned().unwrap_or_default();
                if let Some(ignore) = ignore {
                    neighbors.all.retain(|n| !ignore.contains(n));
                }
                (*range, neighbors)
            })
            .collect()
    }

    async fn body(&self, registry: &RepairRegistry, ctx: JobContext) -> Result<(), RepairError> {
        let record = RepairRecord::new(
            self.id,
            JobOrigin::TopologyChange,
            self.reason,
            self.label.keyspace.clone(),
            Vec::new(),
            self.ranges.clone(),
            ReplicaPlan::Neighbors(self.neighbors.clone()),
        );
        registry.add_repair_record(self.id.sequence_number, record.clone());

        // Either the registry or the node operation may abort the job.
        let abort = ctx.abort_token().child_token();
        let _watcher = self.ops.clone().map(|ops| {
            let abort = abort.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                ops.aborted().await;
                abort.cancel();
            }))
        });
        if self.ops.as_ref().is_some_and(NodeOpsHandle::is_aborted) {
            abort.cancel();
        }

        info!(
            id = %self.id,
            keyspace = %self.label.keyspace,
            reason = %self.reason,
            ranges = self.ranges.len(),
            ops_id = self.ops.as_ref().map(NodeOpsHandle::ops_id),
            "starting data-sync repair"
        );
        repair_ranges(registry.gate(), &record, &self.repairer, self.plan(), &abort).await
    }
}

#[async_trait]
impl RepairJob for DataSyncRepair {
    fn id(&self) -> RepairJobId {
        self.id
    }

    fn label(&self) -> &JobLabel {
        &self.label
    }

    #[tracing::instrument(skip_all, fields(id = %self.id, keyspace = %self.label.keyspace, reason = %self.reason))]
    async fn execute(&self, registry: &Arc<RepairRegistry>) -> Result<(), RepairError> {
        registry.hierarchy().register(&self.id.task, &self.label);
        registry
            .run(self.id, |ctx| self.body(registry, ctx))
            .await
    }
}
