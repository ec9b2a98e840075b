//! Operator-requested repair of explicit keyspace tables and ranges.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use reef_types::{
    JobLabel, NeighborFilter, NodeId, RepairJobId, RepairNeighbors, ReplicaSnapshot,
    StreamReason, TokenRange,
};
use tracing::info;

use crate::error::RepairError;
use crate::job::{RangeRepairer, RepairJob, repair_ranges};
use crate::record::{JobOrigin, ReplicaPlan, RepairRecord};
use crate::registry::{JobContext, RepairRegistry};

/// Label kind of operator-requested jobs.
pub const USER_REQUESTED_KIND: &str = "user_requested";

/// What an operator asked to repair.
#[derive(Debug, Clone, Default)]
pub struct RepairRequest {
    /// Target keyspace.
    pub keyspace: String,
    /// Tables to repair; empty means every table.
    pub tables: Vec<String>,
    /// Ranges to repair.
    pub ranges: Vec<TokenRange>,
    /// Only repair against these hosts; empty means any.
    pub hosts: Vec<String>,
    /// Only repair against these datacenters; empty means any.
    pub data_centers: Vec<String>,
    /// Nodes to leave out entirely.
    pub ignore_nodes: HashSet<NodeId>,
}

/// A repair started by an operator.
///
/// Holds the topology snapshot captured at construction time; every range's
/// replica set is resolved from it, so concurrent topology changes cannot
/// shift the set mid-job.
pub struct UserRequestedRepair {
    id: RepairJobId,
    label: JobLabel,
    request: RepairRequest,
    snapshot: Arc<ReplicaSnapshot>,
    repairer: Arc<dyn RangeRepairer>,
}

impl UserRequestedRepair {
    /// Create a job for `request` against the captured `snapshot`.
    pub fn new(
        id: RepairJobId,
        request: RepairRequest,
        snapshot: Arc<ReplicaSnapshot>,
        repairer: Arc<dyn RangeRepairer>,
    ) -> Self {
        let label = JobLabel::new(request.keyspace.clone(), USER_REQUESTED_KIND);
        Self {
            id,
            label,
            request,
            snapshot,
            repairer,
        }
    }

    /// Attach a free-form entity to the job label.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.label = self.label.with_entity(entity);
        self
    }

    /// Topology version the job resolves replicas from.
    pub fn topology_version(&self) -> u64 {
        self.snapshot.version()
    }

    /// Resolve neighbors for every requested range.
    fn plan(&self) -> Result<Vec<(TokenRange, RepairNeighbors)>, RepairError> {
        let filter = NeighborFilter {
            hosts: &self.request.hosts,
            data_centers: &self.request.data_centers,
            ignore_nodes: &self.request.ignore_nodes,
        };
        self.request
            .ranges
            .iter()
            .map(|range| {
                self.snapshot
                    .neighbors(range, &filter)
                    .map(|n| (*range, n))
                    .ok_or(RepairError::UnknownRange(*range))
            })
            .collect()
    }

    async fn body(&self, registry: &RepairRegistry, ctx: JobContext) -> Result<(), RepairError> {
        let record = RepairRecord::new(
            self.id,
            JobOrigin::UserRequested,
            StreamReason::Repair,
            self.request.keyspace.clone(),
            self.request.tables.clone(),
            self.request.ranges.clone(),
            ReplicaPlan::Snapshot(self.snapshot.clone()),
        );
        registry.add_repair_record(self.id.sequence_number, record.clone());
        ctx.check_aborted()?;

        let plan = self.plan()?;
        info!(
            id = %self.id,
            keyspace = %self.request.keyspace,
            ranges = plan.len(),
            topology_version = self.snapshot.version(),
            "starting user-requested repair"
        );
        repair_ranges(
            registry.gate(),
            &record,
            &self.repairer,
            plan,
            ctx.abort_token(),
        )
        .await
    }
}

#[async_trait]
impl RepairJob for UserRequestedRepair {
    fn id(&self) -> RepairJobId {
        self.id
    }

    fn label(&self) -> &JobLabel {
        &self.label
    }

    #[tracing::instrument(skip_all, fields(id = %self.id, keyspace = %self.label.keyspace, kind = %self.label.kind))]
    async fn execute(&self, registry: &Arc<RepairRegistry>) -> Result<(), RepairError> {
        registry.hierarchy().register(&self.id.task, &self.label);
        registry
            .run(self.id, |ctx| self.body(registry, ctx))
            .await
    }
}
