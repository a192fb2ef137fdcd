use thiserror::Error;

/// Basic library error type
#[derive(Debug, Error)]
pub enum Error {
    /// Logging setup error
    #[error("Logging error: {0}")]
    Logging(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
