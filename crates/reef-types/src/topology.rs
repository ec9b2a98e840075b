//! Captured replica topology.
//!
//! A [`ReplicaSnapshot`] is a point-in-time view of which nodes replicate
//! which token ranges. Repair jobs hold it behind an `Arc` so the replica
//! set used for a whole job does not shift under concurrent topology changes.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{NodeId, TokenRange};

/// One replica of a token range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Node identifier.
    pub node_id: NodeId,
    /// Address the node is reachable at, used for host filtering.
    pub host: String,
    /// Datacenter the node lives in.
    pub datacenter: String,
}

/// The peers a range must be compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairNeighbors {
    /// All peer nodes, excluding the local node.
    pub all: Vec<NodeId>,
}

impl RepairNeighbors {
    /// Build a neighbor set from a list of nodes.
    pub fn new(all: Vec<NodeId>) -> Self {
        Self { all }
    }

    /// Whether there is no peer to repair against.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Restrictions applied when turning replicas into neighbors.
///
/// Empty `hosts` or `data_centers` mean "no restriction".
#[derive(Debug, Clone, Copy)]
pub struct NeighborFilter<'a> {
    /// Only peers whose host is listed.
    pub hosts: &'a [String],
    /// Only peers in one of these datacenters.
    pub data_centers: &'a [String],
    /// Peers that must never be contacted.
    pub ignore_nodes: &'a HashSet<NodeId>,
}

/// Immutable mapping from token range to replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    local_node_id: NodeId,
    version: u64,
    ranges: BTreeMap<TokenRange, Vec<Replica>>,
}

impl ReplicaSnapshot {
    /// Create an empty snapshot as seen by `local_node_id`.
    pub fn new(local_node_id: NodeId, version: u64) -> Self {
        Self {
            local_node_id,
            version,
            ranges: BTreeMap::new(),
        }
    }

    /// Add the replica set of one range.
    pub fn with_range(mut self, range: TokenRange, replicas: Vec<Replica>) -> Self {
        self.ranges.insert(range, replicas);
        self
    }

    /// The node this snapshot was captured on.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Topology version the snapshot was captured at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replicas of `range`, or `None` if the range is unknown.
    pub fn replicas(&self, range: &TokenRange) -> Option<&[Replica]> {
        self.ranges.get(range).map(Vec::as_slice)
    }

    /// All ranges known to the snapshot, in token order.
    pub fn ranges(&self) -> impl Iterator<Item = &TokenRange> {
        self.ranges.keys()
    }

    /// Compute the peers to repair `range` against.
    ///
    /// Returns `None` if the range is not part of the snapshot. The local
    /// node is never its own neighbor.
    pub fn neighbors(
        &self,
        range: &TokenRange,
        filter: &NeighborFilter<'_>,
    ) -> Option<RepairNeighbors> {
        let replicas = self.replicas(range)?;
        let all = replicas
            .iter()
            .filter(|r| r.node_id != self.local_node_id)
            .filter(|r| !filter.ignore_nodes.contains(&r.node_id))
            .filter(|r| filter.data_centers.is_empty() || filter.data_centers.contains(&r.datacenter))
            .filter(|r| filter.hosts.is_empty() || filter.hosts.contains(&r.host))
            .map(|r| r.node_id)
            .collect();
        Some(RepairNeighbors { all })
    }
}
