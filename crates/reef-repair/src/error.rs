//! Error types for repair coordination.

use reef_types::{RepairJobId, TokenRange};

/// Errors that can occur while coordinating repair jobs.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// The registry is shutting down and admits no new work.
    #[error("repair registry is shutting down")]
    ShuttingDown,

    /// The waiter's deadline passed before the job finished.
    ///
    /// Only the waiting caller gives up; the job keeps running.
    #[error("timed out waiting for repair job {id} to finish")]
    Timeout {
        /// Sequence number of the job being awaited.
        id: u64,
    },

    /// The job observed an abort request.
    #[error("{0} was aborted")]
    Aborted(RepairJobId),

    /// A single range could not be repaired.
    #[error("repair of range {range} failed: {reason}")]
    RangeFailed {
        /// The range that failed.
        range: TokenRange,
        /// Why it failed.
        reason: String,
    },

    /// Some ranges of a job failed; the others may have completed.
    #[error("{id} failed: {failed} of {total} ranges failed")]
    RangesFailed {
        /// The job.
        id: RepairJobId,
        /// Number of failed ranges.
        failed: u64,
        /// Number of ranges assigned to the job.
        total: u64,
    },

    /// A requested range is not part of the captured topology snapshot.
    #[error("range {0} is not part of the topology snapshot")]
    UnknownRange(TokenRange),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to read a configuration file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a configuration file.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
