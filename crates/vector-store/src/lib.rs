//! # Recall Vector Store
//!
//! Semantic retrieval over short texts: each stored text is embedded into a fixed-length vector,
//! appended to an exact L2 index, and recorded in a position-keyed metadata table under a
//! freshly generated id.
//!
//! ## Features
//!
//! - **Exact nearest-neighbour search** over squared L2 distance
//! - **ONNX Runtime embeddings** on CPU or CUDA, with a deterministic stub mode for tests
//! - **Two persisted artifacts** (binary index + JSON metadata), each versioned and written atomically
//! - **Concurrent access**: many readers, one writer
//!
//! ## Architecture
//!
//! ```text
//! text
//!   │
//!   ├──> Embedder (ONNX / stub)
//!   │      └─> Vector[D]
//!   │
//!   ├──> FlatL2Index ──────> index file (RVI1)
//!   │      └─> position
//!   │
//!   └──> MetadataTable ────> metadata file (JSON, schema_version)
//!          └─> position ⇄ embeddingID
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use recall_vector_store::{StoreConfig, VectorStore};
//!
//! #[tokio::main]
//! async fn main() -> recall_vector_store::Result<()> {
//!     let store = VectorStore::open(StoreConfig::from_env()?).await?;
//!
//!     store.store("I like apples").await?;
//!     store.store("The car is fast").await?;
//!
//!     for id in store.search("fruit", 1).await? {
//!         println!("{id}");
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod device;
mod embeddings;
mod error;
mod flat_index;
mod metadata;
mod persist;
mod store;

pub use config::{
    parse_dimension, StoreConfig, DEFAULT_DIMENSION, DEFAULT_INDEX_FILE, DEFAULT_METADATA_FILE,
    DEFAULT_MODEL_ID,
};
pub use device::{
    bootstrap_cuda_env_best_effort, cuda_disabled_by_env, diagnose_gpu_env, resolve_device,
    Device, DevicePreference, GpuEnvReport,
};
pub use embeddings::{
    load_embedder, load_manifest, model_dir, normalize_model_id, resolve_model_spec, Embedder,
    EmbeddingMode, ManifestAsset, ManifestModel, ModelSpec, ModelsManifest, OnnxEmbedder,
    StubEmbedder,
};
pub use error::{Result, VectorStoreError};
pub use flat_index::{FlatL2Index, INDEX_FORMAT_VERSION};
pub use metadata::{
    Fields, MetadataHeader, MetadataTable, EMBEDDING_ID_KEY, METADATA_SCHEMA_VERSION,
};
pub use store::{SearchHit, StoreStats, VectorStore};
