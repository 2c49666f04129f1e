//! Error types for the replication engine

use thiserror::Error;

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the replication engine
///
/// Variants are *kinds*, not sources: retry and escalation policy is driven
/// by the kind predicates below, not by where the error was produced.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from socket and transport operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Temporary failures (TMPFAIL, connection reset, short read)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Server list or vBucket ownership drift (NOT_MY_VBUCKET)
    #[error("Topology changed: {0}")]
    TopologyChanged(String),

    /// DCP producer demands a rollback to an earlier sequence number
    #[error("Rollback required for vb {vbno} to seqno {seqno}")]
    Rollback {
        /// vBucket that rolled back
        vbno: u16,
        /// Highest sequence number the producer will accept
        seqno: u64,
    },

    /// Malformed JSON, xattr section or wire payload on a single mutation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Authentication or authorization failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Requested metadata entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure on a metadata write
    #[error("Revision conflict: {0}")]
    Conflict(String),

    /// Settings key not present in the schema
    #[error("Invalid settings key: {0}")]
    InvalidSettingsKey(String),

    /// Settings value kind does not match the schema
    #[error("Type mismatch for {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Settings key
        key: String,
        /// Expected kind
        expected: String,
        /// Actual kind
        actual: String,
    },

    /// Settings value outside its schema range
    #[error("Value {value} for {key} out of range [{min}, {max}]")]
    ValueOutOfRange {
        /// Settings key
        key: String,
        /// Offending value
        value: i64,
        /// Range lower bound
        min: i64,
        /// Range upper bound
        max: i64,
    },

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Pipeline lifecycle error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Children did not stop within the shutdown deadline
    #[error("Stop timeout: {0}")]
    StopTimeout(String),

    /// Invariant violation or unrecoverable failure
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// Create a topology-changed error
    pub fn topology(msg: impl Into<String>) -> Self {
        Error::TopologyChanged(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a pipeline error
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Error::Pipeline(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Whether the operation may be retried in place with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether the error calls for a topology refresh and re-route
    pub fn is_topology_changed(&self) -> bool {
        matches!(self, Error::TopologyChanged(_))
    }

    /// Whether the error must stop the pipeline
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fatal(_) | Error::Unauthorized(_) | Error::StopTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("tmpfail").is_transient());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_transient());
        assert!(!Error::fatal("broken invariant").is_transient());
        assert!(!Error::NotFound("key".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::fatal("x").is_fatal());
        assert!(Error::Unauthorized("bad credentials".into()).is_fatal());
        assert!(!Error::transient("x").is_fatal());
        assert!(!Error::TopologyChanged("vb moved".into()).is_fatal());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::Rollback { vbno: 7, seqno: 50 };
        assert!(err.to_string().contains("vb 7"));
        assert!(err.to_string().contains("50"));
    }
}
