use crate::device::DevicePreference;
use crate::embeddings::EmbeddingMode;
use crate::error::{Result, VectorStoreError};
use std::path::PathBuf;

pub const DEFAULT_MODEL_ID: &str = "all-minilm-l6-v2";
pub const DEFAULT_DIMENSION: usize = 384;
pub const DEFAULT_INDEX_FILE: &str = "faiss_index_file.index";
pub const DEFAULT_METADATA_FILE: &str = "metadata.pkl";

// (preferred key, legacy key)
const MODEL_KEYS: (&str, &str) = ("RECALL_EMBEDDING_MODEL", "EMBEDDING_MODEL_NAME");
const DIMENSION_KEYS: (&str, &str) = ("RECALL_VECTOR_DIM", "VECTOR_DIM");
const INDEX_FILE_KEYS: (&str, &str) = ("RECALL_INDEX_FILE", "FAISS_INDEX_FILE");
const METADATA_FILE_KEYS: (&str, &str) = ("RECALL_METADATA_FILE", "METADATA_FILE");
const DEVICE_KEY: &str = "RECALL_DEVICE";
const CUDA_DEVICE_KEY: &str = "RECALL_CUDA_DEVICE";
const EMBEDDING_MODE_KEY: &str = "RECALL_EMBEDDING_MODE";
const MODEL_DIR_KEY: &str = "RECALL_MODEL_DIR";

/// Everything a [`crate::VectorStore`] needs to open its embedder and artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub model_id: String,
    pub dimension: usize,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
    pub device: DevicePreference,
    pub cuda_device_id: i32,
    pub embedding_mode: EmbeddingMode,
    /// `None` resolves through [`crate::embeddings::model_dir`].
    pub model_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            dimension: DEFAULT_DIMENSION,
            index_path: PathBuf::from(DEFAULT_INDEX_FILE),
            metadata_path: PathBuf::from(DEFAULT_METADATA_FILE),
            device: DevicePreference::Auto,
            cuda_device_id: 0,
            embedding_mode: EmbeddingMode::Fast,
            model_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key/value source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let get_pair = |(preferred, legacy): (&str, &str)| get(preferred).or_else(|| get(legacy));

        let mut config = Self::default();
        if let Some(model_id) = get_pair(MODEL_KEYS) {
            config.model_id = model_id;
        }
        if let Some(raw) = get_pair(DIMENSION_KEYS) {
            config.dimension = parse_dimension(&raw)?;
        }
        if let Some(path) = get_pair(INDEX_FILE_KEYS) {
            config.index_path = PathBuf::from(path);
        }
        if let Some(path) = get_pair(METADATA_FILE_KEYS) {
            config.metadata_path = PathBuf::from(path);
        }
        if let Some(raw) = get(DEVICE_KEY) {
            config.device = raw.parse()?;
        }
        if let Some(raw) = get(CUDA_DEVICE_KEY) {
            config.cuda_device_id = raw.parse().map_err(|e| {
                VectorStoreError::Config(format!("Invalid {CUDA_DEVICE_KEY} '{raw}': {e}"))
            })?;
        }
        if let Some(raw) = get(EMBEDDING_MODE_KEY) {
            config.embedding_mode = raw.parse()?;
        }
        if let Some(dir) = get(MODEL_DIR_KEY) {
            config.model_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_paths(mut self, index_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        self.index_path = index_path.into();
        self.metadata_path = metadata_path.into();
        self
    }
}

pub fn parse_dimension(raw: &str) -> Result<usize> {
    let dimension: usize = raw
        .trim()
        .parse()
        .map_err(|e| VectorStoreError::Config(format!("Invalid vector dimension '{raw}': {e}")))?;
    if dimension == 0 {
        return Err(VectorStoreError::Config(
            "Vector dimension must be greater than zero".to_string(),
        ));
    }
    Ok(dimension)
}
