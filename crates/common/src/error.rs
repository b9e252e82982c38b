use thiserror::Error;

/// Canonical DatumFlow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`DflError::InvalidConfig`]: pipeline/env/contract violations discovered before work runs
/// - [`DflError::Storage`]: object store, tag, and hashtree cache failures
/// - [`DflError::Execution`]: user-code and runtime task failures
/// - [`DflError::Io`]: raw filesystem/network IO failures from std APIs
/// - [`DflError::UnrecognizedTask`]: subtask payload decoded as neither known variant
#[derive(Debug, Error)]
pub enum DflError {
    /// Invalid or inconsistent pipeline/environment configuration.
    ///
    /// Examples:
    /// - empty transform command
    /// - shard index outside the shard count
    /// - malformed worker address or port values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object store, tag, or cache failures.
    ///
    /// Examples:
    /// - missing tag or object
    /// - corrupt serialized hashtree
    /// - peer chunk stream transport failures
    #[error("storage error: {0}")]
    Storage(String),

    /// Runtime task failures after the subtask was accepted.
    ///
    /// Examples:
    /// - user code exited non-zero or timed out
    /// - payload encode/decode failures
    /// - task cancellation observed mid-datum
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Subtask payload matched neither the datum nor the merge shape.
    #[error("worker task format unrecognized")]
    UnrecognizedTask,
}

/// Standard DatumFlow result alias.
pub type Result<T> = std::result::Result<T, DflError>;
