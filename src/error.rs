//! Error Taxonomy
//!
//! One crate-wide error enum covering the four failure classes the
//! orchestrator distinguishes: transient infrastructure faults (retried,
//! then surfaced), consistency faults (fatal or degrade-and-warn depending
//! on strictness), precondition violations (fail fast, never retried), and
//! aggregated partial failures from fan-out operations.

use crate::domain::entities::{InstanceId, ShardState};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Host could not be reached after exhausting retries.
    #[error("host {ip} is unreachable: {detail}")]
    Unreachable { ip: String, detail: String },

    /// A remote command ran but failed.
    #[error("command failed on {ip}: `{command}`: {detail}")]
    CommandFailed {
        ip: String,
        command: String,
        detail: String,
    },

    /// A SQL query or statement failed.
    #[error("query failed on {instance}: {detail}")]
    Query { instance: InstanceId, detail: String },

    /// Observed replication state disagrees with expectations.
    #[error("replication inconsistency on {instance}: {detail}")]
    ReplicationInconsistency { instance: InstanceId, detail: String },

    /// The requested operation is not legal in the current situation.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Illegal shard state transition.
    #[error("shard {shard}: illegal transition {from} -> {to}")]
    InvalidTransition {
        shard: String,
        from: ShardState,
        to: ShardState,
    },

    /// The spare allocator could not satisfy a claim.
    #[error("insufficient spares: wanted {wanted}, {available} available")]
    InsufficientSpares { wanted: usize, available: usize },

    /// A bounded wait expired.
    #[error("timed out after {waited_secs}s waiting for {operation}")]
    Timeout { operation: String, waited_secs: u64 },

    /// Transfer destination already holds data and overwrite was not requested.
    #[error("nonzero size exists at {ip}:{path}; refusing to copy without overwrite")]
    NonEmptyDestination { ip: String, path: String },

    /// Post-transfer verification found a name/size mismatch.
    #[error("transfer verification failed for {path}: {detail}")]
    TransferVerification { path: String, detail: String },

    /// Import produced a different row count than the matching export.
    #[error("row count mismatch on {table}: exported {expected}, imported {actual}")]
    RowCountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// One or more items of a fan-out operation failed; every entry names
    /// the offending item.
    #[error("{} of {total} items failed: {}", failures.len(), failures.join("; "))]
    Aggregate { total: usize, failures: Vec<String> },
}

impl Error {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. } | Error::CommandFailed { .. } | Error::Query { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_offender() {
        let err = Error::NonEmptyDestination {
            ip: "10.1.2.3".to_string(),
            path: "/var/lib/mysql/ibdata1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nonzero size exists"));
        assert!(msg.contains("/var/lib/mysql/ibdata1"));
    }

    #[test]
    fn test_aggregate_lists_all_failures() {
        let err = Error::Aggregate {
            total: 3,
            failures: vec!["shard-1: boom".to_string(), "shard-3: bust".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 3"));
        assert!(msg.contains("shard-1"));
        assert!(msg.contains("shard-3"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Unreachable {
            ip: "10.0.0.1".to_string(),
            detail: "x".to_string()
        }
        .is_transient());
        assert!(!Error::Precondition("nope".to_string()).is_transient());
    }
}
