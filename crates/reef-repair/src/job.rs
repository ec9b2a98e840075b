//! Repair job contract and the per-range driver shared by both variants.
//!
//! A job runs under [`RepairRegistry::run`]. Its body registers the job
//! record, then hands every range to [`repair_ranges`], which spawns one
//! worker per range. Each worker checks for abort, acquires gate permits
//! sized to the range's estimated memory footprint, and calls the external
//! [`RangeRepairer`] to do the actual comparison and transfer.

use std::sync::Arc;

use async_trait::async_trait;
use reef_types::{JobLabel, RepairJobId, RepairNeighbors, StreamReason, TokenRange};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RepairError;
use crate::gate::{ConcurrencyGate, GatePermit, MAX_REPAIR_MEMORY_PER_RANGE};
use crate::record::RepairRecord;
use crate::registry::RepairRegistry;

/// One range handed to a [`RangeRepairer`].
#[derive(Debug, Clone)]
pub struct RangeRequest {
    /// The job the range belongs to.
    pub job: RepairJobId,
    /// Target keyspace.
    pub keyspace: String,
    /// Target tables; empty means every table of the keyspace.
    pub tables: Vec<String>,
    /// The range to repair.
    pub range: TokenRange,
    /// Peers to compare against.
    pub neighbors: RepairNeighbors,
    /// Why the data is being repaired.
    pub reason: StreamReason,
    /// Cancelled when the job is aborted. Long transfers should poll it.
    pub abort: CancellationToken,
}

/// Compares one range with its neighbors and streams the differences.
///
/// Abstracts the data path so that tests can mock it.
#[async_trait]
pub trait RangeRepairer: Send + Sync {
    /// Estimated memory needed to repair `request`. Defaults to one full
    /// range budget.
    fn estimated_memory(&self, _request: &RangeRequest) -> u64 {
        MAX_REPAIR_MEMORY_PER_RANGE
    }

    /// Repair one range.
    async fn repair_range(&self, request: RangeRequest) -> Result<(), RepairError>;
}

/// A repair job that can be executed against a registry.
#[async_trait]
pub trait RepairJob: Send + Sync {
    /// The job's identity.
    fn id(&self) -> RepairJobId;

    /// Observability label.
    fn label(&self) -> &JobLabel;

    /// Run the job to completion under the registry's lifecycle.
    ///
    /// On failure the job is left `Failed` in the registry and the error is
    /// returned.
    async fn execute(&self, registry: &Arc<RepairRegistry>) -> Result<(), RepairError>;
}

/// Repair `plan` on behalf of the job owning `record`.
///
/// Ranges without neighbors count as finished without doing any work. Every
/// other range runs in its own task; a failing range does not stop its
/// siblings. Abort is observed before and while waiting for gate permits;
/// once a range holds permits it runs to completion.
pub(crate) async fn repair_ranges(
    gate: &ConcurrencyGate,
    record: &Arc<RepairRecord>,
    repairer: &Arc<dyn RangeRepairer>,
    plan: Vec<(TokenRange, RepairNeighbors)>,
    abort: &CancellationToken,
) -> Result<(), RepairError> {
    let id = record.id();
    if abort.is_cancelled() {
        return Err(RepairError::Aborted(id));
    }

    let mut workers = JoinSet::new();
    for (range, neighbors) in plan {
        if neighbors.is_empty() {
            debug!(%id, %range, "no neighbors, skipping range");
            record.range_finished();
            continue;
        }

        let request = RangeRequest {
            job: id,
            keyspace: record.keyspace().to_string(),
            tables: record.tables().to_vec(),
            range,
            neighbors,
            reason: record.reason(),
            abort: abort.clone(),
        };
        let gate = gate.clone();
        let record = record.clone();
        let repairer = repairer.clone();
        workers.spawn(async move { repair_one(&gate, &record, repairer.as_ref(), request).await });
    }

    let mut failed = 0u64;
    let mut aborted = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(RepairError::Aborted(_))) => aborted = true,
            Ok(Err(e)) => {
                failed += 1;
                warn!(%id, error = %e, "range repair failed");
            }
            Err(e) => {
                failed += 1;
                record.range_failed();
                warn!(%id, error = %e, "range repair task panicked");
            }
        }
    }

    let progress = record.progress();
    debug!(
        %id,
        finished = progress.finished,
        failed = progress.failed,
        total = progress.total,
        "all ranges processed"
    );

    if aborted {
        Err(RepairError::Aborted(id))
    } else if failed > 0 {
        Err(RepairError::RangesFailed {
            id,
            failed,
            total: progress.total,
        })
    } else {
        Ok(())
    }
}

/// Repair a single range: abort check, gate admission, work, accounting.
async fn repair_one(
    gate: &ConcurrencyGate,
    record: &RepairRecord,
    repairer: &dyn RangeRepairer,
    request: RangeRequest,
) -> Result<(), RepairError> {
    let id = request.job;
    let range = request.range;
    let abort = request.abort.clone();
    if abort.is_cancelled() {
        return Err(RepairError::Aborted(id));
    }

    let bytes = repairer.estimated_memory(&request);
    let permit = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(RepairError::Aborted(id)),
        permit = gate.acquire(bytes) => permit?,
    };
    let held = HeldGateBytes::new(record, permit);
    debug!(%id, %range, bytes = held.permit.bytes(), "range admitted");

    let result = repairer.repair_range(request).await;
    drop(held);

    match &result {
        Ok(()) => {
            record.range_finished();
            debug!(%id, %range, "range repaired");
        }
        Err(_) => record.range_failed(),
    }
    result
}

/// A gate permit charged to a job record.
///
/// Dropping it releases the permit and uncharges the record, on every exit
/// path including a panicking or cancelled range.
struct HeldGateBytes<'a> {
    record: &'a RepairRecord,
    permit: GatePermit,
}

impl<'a> HeldGateBytes<'a> {
    fn new(record: &'a RepairRecord, permit: GatePermit) -> Self {
        record.gate_acquired(permit.bytes());
        Self { record, permit }
    }
}

impl Drop for HeldGateBytes<'_> {
    fn drop(&mut self) {
        self.record.gate_released(self.permit.bytes());
    }
}
