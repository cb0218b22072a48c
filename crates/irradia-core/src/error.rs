//! Error types for the probe volume runtime.

use thiserror::Error;

/// Runtime-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value is inconsistent with the running pools
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A baked data file is missing
    #[error("Missing asset: {0}")]
    MissingAsset(String),

    /// A baked data file exists but its contents are unusable
    #[error("Corrupt asset: {0}")]
    CorruptAsset(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
