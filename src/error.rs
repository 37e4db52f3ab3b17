use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while configuring or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Queue capacity was negative; only 0 (unbounded) or a positive bound is valid
    #[error("Invalid queue capacity {0}: expected 0 (unbounded) or a positive bound")]
    InvalidCapacity(i64),

    /// No source stage was configured
    #[error("Cannot build pipeline without a source stage")]
    MissingSource,

    /// No sink stage was configured
    #[error("Cannot build pipeline without a sink stage")]
    MissingSink,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Stage execution error
    #[error("Stage execution failed: {0}")]
    StageError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),
}
