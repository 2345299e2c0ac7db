use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorStoreError>;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported or corrupt file format: {0}")]
    Format(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl VectorStoreError {
    /// Persistence-side failures: the artifact could not be read or written.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serialization(_) | Self::Format(_))
    }

    /// Per-call embedding failures; the store remains usable afterwards.
    #[must_use]
    pub const fn is_embedding(&self) -> bool {
        matches!(self, Self::Embedding(_) | Self::InvalidDimension { .. })
    }
}
