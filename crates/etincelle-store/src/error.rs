use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A lookup expected exactly one document but found none.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Backend failure (network, engine, serialization). The in-memory
    /// implementation never produces this; an external document store does.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
