use thiserror::Error;

/// Canonical nanoquery error taxonomy used across crates.
///
/// Classification guidance:
/// - [`NqError::InvalidConfig`]: missing table locations, missing columns, bad option values
/// - [`NqError::Planning`]: descriptor/key-shape issues discovered before any row is read
/// - [`NqError::Execution`]: parquet/arrow encode or decode failures, spill/merge state errors
/// - [`NqError::Unsupported`]: valid input using a column type outside the supported set
/// - [`NqError::Io`]: raw filesystem failures from std APIs
///
/// Empty tables, one-sided buckets and zero-row joins are results, never errors.
#[derive(Debug, Error)]
pub enum NqError {
    /// Invalid or inconsistent configuration/catalog state.
    ///
    /// Examples:
    /// - missing table path for a table named by the query
    /// - a required column absent from the table schema
    /// - zero batch size or partition count
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Query planning failures.
    ///
    /// Examples:
    /// - join step referencing a table with no location
    /// - join keys of incompatible classes (integral vs string)
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - parquet decode/encode failures
    /// - null keys observed in a stream that must be sorted and null-free
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a type/shape that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard nanoquery result alias.
pub type Result<T> = std::result::Result<T, NqError>;
