use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Encoding error: {0}")]
    EncodingError(#[from] serde_json::Error),

    #[error("Invalid accept pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Signal error: {0}")]
    SignalError(#[from] nix::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
