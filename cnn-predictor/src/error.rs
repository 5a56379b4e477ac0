//! Error types for checkpoint restore and prediction.

/// Result type alias using the predictor's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem errors while reading or writing checkpoints
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed `.meta` graph description
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// Checkpoint contents that do not line up with their metadata
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Requested scope has no graph in the checkpoint
    #[error("no graph registered under scope `{0}`")]
    MissingScope(String),

    /// Array shapes that cannot be fed through the network
    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}
