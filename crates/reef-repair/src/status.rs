//! Status table: explicit entries for running and failed jobs only.
//!
//! A job that finished successfully has no entry. [`StatusTable::lookup`] is
//! the one place that turns "no entry" into either `Successful` or
//! `NotExist`, depending on whether the id was ever issued.

use std::collections::BTreeMap;

use reef_types::RepairStatus;

/// The two states that are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredStatus {
    Running,
    Failed,
}

/// Per-shard status table and sequence number source.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: BTreeMap<u64, StoredStatus>,
    highest_issued: u64,
}

impl StatusTable {
    /// Create an empty table. The first issued sequence number is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number.
    pub fn issue(&mut self) -> u64 {
        self.highest_issued += 1;
        self.highest_issued
    }

    /// Highest sequence number issued so far (0 if none).
    pub fn highest_issued(&self) -> u64 {
        self.highest_issued
    }

    /// Record `seq` as running.
    pub fn mark_running(&mut self, seq: u64) {
        self.entries.insert(seq, StoredStatus::Running);
    }

    /// Record `seq` as failed. The entry is kept until explicitly cleared.
    pub fn mark_failed(&mut self, seq: u64) {
        self.entries.insert(seq, StoredStatus::Failed);
    }

    /// Drop the entry for `seq`, turning it into an inferred success.
    pub fn clear(&mut self, seq: u64) {
        self.entries.remove(&seq);
    }

    /// Whether `seq` has an explicit entry.
    pub fn contains(&self, seq: u64) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Resolve the status of `seq`.
    pub fn lookup(&self, seq: u64) -> RepairStatus {
        match self.entries.get(&seq) {
            Some(StoredStatus::Running) => RepairStatus::Running,
            Some(StoredStatus::Failed) => RepairStatus::Failed,
            None if seq >= 1 && seq <= self.highest_issued => RepairStatus::Successful,
            None => RepairStatus::NotExist,
        }
    }

    /// Running sequence numbers in ascending order.
    pub fn running(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries
            .iter()
            .filter(|(_, s)| **s == StoredStatus::Running)
            .map(|(seq, _)| *seq)
    }

    /// Number of running entries.
    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// Number of failed entries.
    pub fn failed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|s| **s == StoredStatus::Failed)
            .count()
    }
}
