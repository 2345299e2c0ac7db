use crate::config::StoreConfig;
use crate::device::{resolve_device, Device};
use crate::embeddings::{load_embedder, Embedder, EmbeddingMode};
use crate::error::{Result, VectorStoreError};
use crate::flat_index::FlatL2Index;
use crate::metadata::{Fields, MetadataHeader, MetadataTable};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub position: usize,
    /// Squared L2 distance to the query vector.
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub vectors: usize,
    pub metadata_entries: usize,
    pub dimension: usize,
    pub model_id: String,
    pub device: Device,
    /// True when inference runs on a GPU execution provider.
    pub accelerated: bool,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
}

struct StoreState {
    index: FlatL2Index,
    metadata: MetadataTable,
}

/// Append-only text → vector store with a flat L2 index and per-position metadata.
///
/// `store` calls are serialized behind a write lock that covers the append and both file
/// rewrites; `search` calls share a read lock and never observe a half-applied insert.
pub struct VectorStore {
    config: StoreConfig,
    device: Device,
    embedder: Arc<dyn Embedder>,
    state: RwLock<StoreState>,
}

impl VectorStore {
    /// Resolves the device, loads the configured embedder and opens the on-disk artifacts.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let device = match config.embedding_mode {
            EmbeddingMode::Stub => Device::Cpu,
            EmbeddingMode::Fast => resolve_device(config.device, config.cuda_device_id)?,
        };
        let embedder = load_embedder(&config, device)?;
        Self::with_embedder(config, device, embedder).await
    }

    /// Opens the artifacts named by `config` around an already constructed embedder.
    pub async fn with_embedder(
        config: StoreConfig,
        device: Device,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        if embedder.dimension() != config.dimension {
            return Err(VectorStoreError::ModelLoad(format!(
                "model '{}' produces {}-dimensional vectors but the store is configured for {}",
                embedder.model_id(),
                embedder.dimension(),
                config.dimension
            )));
        }

        log::info!(
            "Opening VectorStore (index {:?}, metadata {:?}, device {device})",
            config.index_path,
            config.metadata_path
        );

        let index = if config.index_path.exists() {
            FlatL2Index::load(&config.index_path, config.dimension).await?
        } else {
            FlatL2Index::new(config.dimension)
        };

        let mut metadata = if config.metadata_path.exists() {
            let (table, header) = MetadataTable::load(&config.metadata_path).await?;
            check_header(&header, &config, embedder.model_id())?;
            table
        } else {
            MetadataTable::new()
        };

        reconcile(&index, &mut metadata);
        log::info!(
            "VectorStore ready: {} vectors, {} metadata entries",
            index.len(),
            metadata.len()
        );

        Ok(Self {
            config,
            device,
            embedder,
            state: RwLock::new(StoreState { index, metadata }),
        })
    }

    /// Embeds `text`, appends it, rewrites both artifacts, and returns the new id.
    pub async fn store(&self, text: &str) -> Result<String> {
        self.store_with_fields(text, Fields::new()).await
    }

    /// Like [`Self::store`], recording extra caller fields next to the generated id.
    pub async fn store_with_fields(&self, text: &str, fields: Fields) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let vector = self.embed_checked(text).await?;

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        // Stale metadata past the index end (left by `load_index` of a shorter file) must not
        // claim the new position.
        drop_stale(&state.index, &mut state.metadata);
        if state.metadata.position_of(&id).is_some() {
            return Err(VectorStoreError::Index(format!(
                "embedding id {id} is already recorded"
            )));
        }
        let position = state.index.add(&vector)?;
        // Index first, then metadata. A crash in between leaves one orphan vector, which the
        // query path skips.
        state.index.save(&self.config.index_path).await?;
        state.metadata.insert(position, &id, fields)?;
        state
            .metadata
            .save(&self.config.metadata_path, &self.header())
            .await?;

        log::debug!("Stored {id} at position {position}");
        Ok(id)
    }

    /// Ids of the `top_k` nearest stored texts, nearest first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .search_with_scores(query, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.id)
            .collect())
    }

    pub async fn search_with_scores(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if top_k == 0 || self.state.read().await.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embed_checked(query).await?;
        let state = self.state.read().await;
        let neighbors = state.index.search(&vector, top_k)?;
        let hits: Vec<SearchHit> = neighbors
            .into_iter()
            .filter_map(|(position, distance)| {
                state
                    .metadata
                    .embedding_id_at(position)
                    .map(|id| SearchHit {
                        id: id.to_string(),
                        position,
                        distance,
                    })
            })
            .collect();

        log::debug!("Search (top_k {top_k}) returned {} hits", hits.len());
        Ok(hits)
    }

    /// Writes the index to `path` in the device-neutral on-disk format.
    pub async fn save_index(&self, path: impl AsRef<Path>) -> Result<()> {
        self.state.read().await.index.save(path).await
    }

    /// Replaces the in-memory index with the one stored at `path`.
    ///
    /// Metadata beyond the new index length is kept until the next `store`, so the two
    /// loaders may run in either order.
    pub async fn load_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let index = FlatL2Index::load(path, self.config.dimension).await?;
        let mut state = self.state.write().await;
        state.index = index;
        log_mismatch(&state.index, &state.metadata);
        Ok(())
    }

    pub async fn save_metadata(&self, path: impl AsRef<Path>) -> Result<()> {
        let header = self.header();
        self.state.read().await.metadata.save(path, &header).await
    }

    /// Replaces the in-memory metadata with the table stored at `path`.
    pub async fn load_metadata(&self, path: impl AsRef<Path>) -> Result<()> {
        let (table, header) = MetadataTable::load(path).await?;
        check_header(&header, &self.config, self.embedder.model_id())?;
        let mut state = self.state.write().await;
        state.metadata = table;
        log_mismatch(&state.index, &state.metadata);
        Ok(())
    }

    /// Number of vectors in the index.
    pub async fn len(&self) -> usize {
        self.state.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.index.is_empty()
    }

    pub async fn metadata_len(&self) -> usize {
        self.state.read().await.metadata.len()
    }

    /// Metadata fields recorded for `id`.
    pub async fn get(&self, id: &str) -> Option<Fields> {
        self.state.read().await.metadata.get(id).cloned()
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            vectors: state.index.len(),
            metadata_entries: state.metadata.len(),
            dimension: self.config.dimension,
            model_id: self.embedder.model_id().to_string(),
            device: self.device,
            accelerated: self.device.is_accelerated(),
            index_path: self.config.index_path.clone(),
            metadata_path: self.config.metadata_path.clone(),
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.config.dimension
    }

    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn embed_checked(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.config.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn header(&self) -> MetadataHeader {
        MetadataHeader {
            dimension: self.config.dimension,
            model_id: self.embedder.model_id().to_string(),
        }
    }
}

fn check_header(header: &MetadataHeader, config: &StoreConfig, model_id: &str) -> Result<()> {
    if header.dimension != config.dimension {
        return Err(VectorStoreError::InvalidDimension {
            expected: config.dimension,
            actual: header.dimension,
        });
    }
    if header.model_id != model_id {
        log::warn!(
            "Metadata was written by model '{}' but the store now embeds with '{model_id}'",
            header.model_id
        );
    }
    Ok(())
}

/// Metadata past the end of the index describes no vector; it is dropped so the next insert
/// can claim that position. An index ahead of metadata is kept and its tail skipped by search.
fn reconcile(index: &FlatL2Index, metadata: &mut MetadataTable) {
    drop_stale(index, metadata);
    log_mismatch(index, metadata);
}

fn drop_stale(index: &FlatL2Index, metadata: &mut MetadataTable) {
    if metadata.end_position() > index.len() {
        let dropped = metadata.truncate(index.len());
        log::warn!("Dropped {dropped} metadata entries with no matching vector");
    }
}

fn log_mismatch(index: &FlatL2Index, metadata: &MetadataTable) {
    if index.len() != metadata.len() {
        log::warn!(
            "Index holds {} vectors but metadata has {} entries; unmatched positions are skipped",
            index.len(),
            metadata.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::StubEmbedder;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn config_in(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            dimension: DIM,
            embedding_mode: EmbeddingMode::Stub,
            ..StoreConfig::default()
        }
        .with_paths(dir.path().join("vectors.index"), dir.path().join("metadata.pkl"))
    }

    async fn stub_store(dir: &TempDir) -> VectorStore {
        VectorStore::with_embedder(
            config_in(dir),
            Device::Cpu,
            Arc::new(StubEmbedder::new("stub", DIM)),
        )
        .await
        .unwrap()
    }

    /// Counts calls and returns vectors of a configurable length.
    struct CountingEmbedder {
        calls: AtomicUsize,
        output_len: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.5; self.output_len]).collect())
        }
    }

    #[tokio::test]
    async fn stub_mode_opens_through_config() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(config_in(&dir)).await.unwrap();
        assert_eq!(store.device(), Device::Cpu);
        assert!(store.is_empty().await);
        let id = store.store("hello").await.unwrap();
        assert_eq!(store.search("hello", 1).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn store_appends_to_both_structures_and_files() {
        let dir = TempDir::new().unwrap();
        let store = stub_store(&dir).await;

        let id = store.store("first").await.unwrap();
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.metadata_len().await, 1);
        assert!(store.config().index_path.exists());
        assert!(store.config().metadata_path.exists());
        assert_eq!(
            store.get(&id).await.unwrap()["embeddingID"],
            serde_json::json!(id)
        );
    }

    #[tokio::test]
    async fn caller_fields_are_kept() {
        let dir = TempDir::new().unwrap();
        let store = stub_store(&dir).await;
        let fields = serde_json::json!({"source": "handbook.pdf", "page": 12})
            .as_object()
            .cloned()
            .unwrap();
        let id = store.store_with_fields("text", fields).await.unwrap();
        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored["source"], "handbook.pdf");
        assert_eq!(stored["page"], 12);
    }

    #[tokio::test]
    async fn empty_store_and_zero_k_do_not_embed() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            output_len: DIM,
        });
        let store = VectorStore::with_embedder(config_in(&dir), Device::Cpu, embedder.clone())
            .await
            .unwrap();

        assert!(store.search("anything", 5).await.unwrap().is_empty());
        store.store("x").await.unwrap();
        assert!(store.search("anything", 0).await.unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_length_embedding_fails_without_mutating() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            output_len: DIM - 1,
        });
        let store = VectorStore::with_embedder(config_in(&dir), Device::Cpu, embedder)
            .await
            .unwrap();

        let err = store.store("x").await.unwrap_err();
        assert!(err.is_embedding(), "{err}");
        assert_eq!(store.len().await, 0);
        assert!(!store.config().index_path.exists());
    }

    #[tokio::test]
    async fn embedder_dimension_must_match_config() {
        let dir = TempDir::new().unwrap();
        let Err(err) = VectorStore::with_embedder(
            config_in(&dir),
            Device::Cpu,
            Arc::new(StubEmbedder::new("stub", DIM * 2)),
        )
        .await
        else {
            panic!("expected dimension mismatch to fail");
        };
        assert!(matches!(err, VectorStoreError::ModelLoad(_)), "{err}");
    }

    #[tokio::test]
    async fn reopening_with_another_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        stub_store(&dir).await.store("x").await.unwrap();

        let config = StoreConfig {
            dimension: DIM * 2,
            ..config_in(&dir)
        };
        let Err(err) = VectorStore::with_embedder(
            config,
            Device::Cpu,
            Arc::new(StubEmbedder::new("stub", DIM * 2)),
        )
        .await
        else {
            panic!("expected dimension mismatch to fail");
        };
        assert!(matches!(err, VectorStoreError::InvalidDimension { .. }), "{err}");
    }

    #[tokio::test]
    async fn metadata_ahead_of_index_is_trimmed_on_open() {
        let dir = TempDir::new().unwrap();
        let store = stub_store(&dir).await;
        store.store("a").await.unwrap();
        let snapshot = std::fs::read(&store.config().index_path).unwrap();
        store.store("b").await.unwrap();
        drop(store);
        std::fs::write(dir.path().join("vectors.index"), snapshot).unwrap();

        let reopened = stub_store(&dir).await;
        assert_eq!(reopened.len().await, 1);
        assert_eq!(reopened.metadata_len().await, 1);
        reopened.store("c").await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.metadata_len().await, 2);
    }

    #[tokio::test]
    async fn corrupt_index_file_surfaces_as_io_family_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vectors.index"), b"garbage").unwrap();
        let Err(err) = VectorStore::with_embedder(
            config_in(&dir),
            Device::Cpu,
            Arc::new(StubEmbedder::new("stub", DIM)),
        )
        .await
        else {
            panic!("expected corrupt index to fail");
        };
        assert!(err.is_io(), "{err}");
    }

    #[tokio::test]
    async fn stats_report_counts_and_paths() {
        let dir = TempDir::new().unwrap();
        let store = stub_store(&dir).await;
        store.store("a").await.unwrap();
        let stats = store.stats().await;
        assert_eq!(stats.vectors, 1);
        assert_eq!(stats.metadata_entries, 1);
        assert_eq!(stats.dimension, DIM);
        assert_eq!(stats.model_id, "stub");
        assert!(!stats.accelerated);
        assert_eq!(stats.index_path, dir.path().join("vectors.index"));
    }
}
