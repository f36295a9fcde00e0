use thiserror::Error;

/// Storage engine failures
///
/// Unmet preconditions (add of a present key, CAS mismatch, incr of a
/// non-numeric value) are reported through operation outcomes, not here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Memory limit exceeded: {used} of {limit} bytes in use")]
    MemoryLimitExceeded { used: usize, limit: usize },

    #[error("Value too large: {0} bytes")]
    ValueTooLarge(usize),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;
