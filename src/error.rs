use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid model filename '{0}': must be a bare file name")]
    InvalidFilename(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("No leader available")]
    NoLeader,
}
