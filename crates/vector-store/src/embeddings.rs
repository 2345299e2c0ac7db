use crate::config::{StoreConfig, DEFAULT_DIMENSION, DEFAULT_MODEL_ID};
use crate::device::Device;
use crate::error::{Result, VectorStoreError};
use async_trait::async_trait;
use ndarray::{Array, Axis, Dimension, Ix2, Ix3};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Input, Session, SessionInputs};
use ort::tensor::TensorElementType;
use ort::value::{DynTensor, Tensor};
use ort::Error as OrtError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tokio::task::spawn_blocking;

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SCHEMA_VERSION: u32 = 1;
const CACHE_DIR_NAME: &str = "recall";

/// Maps text to fixed-length vectors. Implementations must be deterministic for a given
/// model and input.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| VectorStoreError::Embedding("Empty embedding result".to_string()))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum EmbeddingMode {
    /// ONNX Runtime inference over the configured model.
    #[default]
    Fast,
    /// Deterministic hash vectors; no model files needed.
    Stub,
}

impl FromStr for EmbeddingMode {
    type Err = VectorStoreError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "stub" => Ok(Self::Stub),
            other => Err(VectorStoreError::Config(format!(
                "Unsupported embedding mode '{other}' (expected 'fast' or 'stub')"
            ))),
        }
    }
}

impl fmt::Display for EmbeddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Stub => "stub",
        })
    }
}

/// Builds the embedder described by `config`, placed on `device`.
pub fn load_embedder(config: &StoreConfig, device: Device) -> Result<Arc<dyn Embedder>> {
    let model_id = normalize_model_id(&config.model_id);
    match config.embedding_mode {
        EmbeddingMode::Stub => Ok(Arc::new(StubEmbedder::new(model_id, config.dimension))),
        EmbeddingMode::Fast => {
            let dir = config.model_dir.clone().unwrap_or_else(model_dir);
            let spec = resolve_model_spec(&dir, &model_id)?;
            let embedder = OnnxEmbedder::new(&spec, &dir, device)?;
            Ok(Arc::new(embedder))
        }
    }
}

/// Normalizes common spellings of a model id (`sentence-transformers/all-MiniLM-L6-v2`, ...).
#[must_use]
pub fn normalize_model_id(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let name = lowered
        .strip_prefix("sentence-transformers/")
        .unwrap_or(&lowered);
    match name {
        "minilm" | "all-minilm" => DEFAULT_MODEL_ID.to_string(),
        other => other.to_string(),
    }
}

pub fn model_dir() -> PathBuf {
    if let Ok(path) = std::env::var("RECALL_MODEL_DIR") {
        return PathBuf::from(path);
    }

    // A `models/manifest.json` next to the binary (or any ancestor) wins over hidden caches.
    let starts = [
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        std::env::current_dir().ok(),
    ];
    for start in starts.into_iter().flatten() {
        for dir in start.ancestors() {
            let candidate = dir.join("models");
            if candidate.join(MANIFEST_FILE).exists() {
                return candidate;
            }
        }
    }

    if let Ok(path) = std::env::var("XDG_CACHE_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path).join(CACHE_DIR_NAME).join("models");
        }
    }

    std::env::var("HOME")
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
        .join(".cache")
        .join(CACHE_DIR_NAME)
        .join("models")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub onnx_rel_path: PathBuf,
    pub tokenizer_rel_path: PathBuf,
    pub dimension: usize,
    pub max_length: usize,
    pub max_batch: usize,
}

impl ModelSpec {
    fn builtin_default() -> Self {
        Self {
            id: DEFAULT_MODEL_ID.to_string(),
            onnx_rel_path: PathBuf::from("model.onnx"),
            tokenizer_rel_path: PathBuf::from("tokenizer.json"),
            dimension: DEFAULT_DIMENSION,
            max_length: 256,
            max_batch: 32,
        }
    }

    #[must_use]
    pub fn model_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.id).join(&self.onnx_rel_path)
    }

    #[must_use]
    pub fn tokenizer_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.id).join(&self.tokenizer_rel_path)
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelsManifest {
    pub schema_version: u32,
    pub models: Vec<ManifestModel>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestModel {
    pub id: String,
    pub dimension: usize,
    pub max_length: usize,
    pub max_batch: usize,
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestAsset {
    pub path: String,
    #[serde(default)]
    pub sha256: String,
}

/// Reads `<model_dir>/manifest.json`; `Ok(None)` when there is no manifest.
pub fn load_manifest(model_dir: &Path) -> Result<Option<ModelsManifest>> {
    let manifest_path = model_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
        VectorStoreError::ModelLoad(format!(
            "Failed to read models manifest {}: {e}",
            manifest_path.display()
        ))
    })?;
    let manifest: ModelsManifest = serde_json::from_str(&raw).map_err(|e| {
        VectorStoreError::ModelLoad(format!(
            "Invalid models manifest {}: {e}",
            manifest_path.display()
        ))
    })?;
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(VectorStoreError::ModelLoad(format!(
            "Unsupported models manifest schema_version {} (expected {MANIFEST_SCHEMA_VERSION})",
            manifest.schema_version
        )));
    }
    Ok(Some(manifest))
}

/// Looks a model id up in the manifest, falling back to the built-in default model layout.
pub fn resolve_model_spec(model_dir: &Path, model_id: &str) -> Result<ModelSpec> {
    let wanted = normalize_model_id(model_id);
    let Some(manifest) = load_manifest(model_dir)? else {
        if wanted == DEFAULT_MODEL_ID {
            return Ok(ModelSpec::builtin_default());
        }
        return Err(VectorStoreError::ModelLoad(format!(
            "Unknown embedding model id '{wanted}' and no models manifest found at {}",
            model_dir.join(MANIFEST_FILE).display()
        )));
    };

    let model = manifest
        .models
        .iter()
        .find(|m| normalize_model_id(&m.id) == wanted)
        .ok_or_else(|| {
            let available = manifest
                .models
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            VectorStoreError::ModelLoad(format!(
                "Unknown embedding model id '{wanted}'. Available: {available}"
            ))
        })?;

    let prefix = format!("{}/", model.id);
    let mut onnx_rel_path: Option<PathBuf> = None;
    let mut tokenizer_rel_path: Option<PathBuf> = None;
    for asset in &model.assets {
        let Some(rel) = asset.path.strip_prefix(&prefix) else {
            continue;
        };
        let asset_path = Path::new(rel);
        if onnx_rel_path.is_none()
            && asset_path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
        {
            onnx_rel_path = Some(safe_rel_path(&model.id, rel)?);
        }
        if tokenizer_rel_path.is_none()
            && asset_path
                .file_name()
                .is_some_and(|name| name.eq_ignore_ascii_case("tokenizer.json"))
        {
            tokenizer_rel_path = Some(safe_rel_path(&model.id, rel)?);
        }
    }

    Ok(ModelSpec {
        id: model.id.clone(),
        onnx_rel_path: onnx_rel_path.unwrap_or_else(|| PathBuf::from("model.onnx")),
        tokenizer_rel_path: tokenizer_rel_path.unwrap_or_else(|| PathBuf::from("tokenizer.json")),
        dimension: model.dimension,
        max_length: model.max_length,
        max_batch: model.max_batch.max(1),
    })
}

fn safe_rel_path(model_id: &str, rel: &str) -> Result<PathBuf> {
    let path = Path::new(rel);
    let mut has_component = false;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(VectorStoreError::ModelLoad(format!(
                    "Invalid models manifest asset path for model '{model_id}': '{rel}' (must be relative without '..')"
                )));
            }
            Component::CurDir => {}
            Component::Normal(_) => has_component = true,
        }
    }
    if !has_component {
        return Err(VectorStoreError::ModelLoad(format!(
            "Invalid models manifest asset path for model '{model_id}': empty path"
        )));
    }
    Ok(path.to_path_buf())
}

/// Deterministic embedder used for tests and model-free environments.
#[derive(Clone, Debug)]
pub struct StubEmbedder {
    model_id: String,
    dimension: usize,
}

impl StubEmbedder {
    #[must_use]
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| stub_embed(text, self.dimension))
            .collect())
    }
}

/// Sentence embedder running an ONNX export through ONNX Runtime on the resolved device.
pub struct OnnxEmbedder {
    model_id: String,
    dimension: usize,
    backend: Arc<OrtBackend>,
}

impl OnnxEmbedder {
    pub fn new(spec: &ModelSpec, model_dir: &Path, device: Device) -> Result<Self> {
        let backend = OrtBackend::new(spec, model_dir, device)?;
        Ok(Self {
            model_id: spec.id.clone(),
            dimension: spec.dimension,
            backend: Arc::new(backend),
        })
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let backend = self.backend.clone();
        spawn_blocking(move || backend.embed_batch_blocking(&texts))
            .await
            .map_err(|e| VectorStoreError::Embedding(format!("Join error: {e}")))?
    }
}

struct OrtBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_length: usize,
    max_batch: usize,
    dimension: usize,
}

impl OrtBackend {
    fn new(spec: &ModelSpec, model_dir: &Path, device: Device) -> Result<Self> {
        if !tokenizers::utils::parallelism::is_parallelism_configured() {
            tokenizers::utils::parallelism::set_parallelism(false);
        }

        let model_path = spec.model_path(model_dir);
        let tokenizer_path = spec.tokenizer_path(model_dir);
        if !model_path.exists() || !tokenizer_path.exists() {
            return Err(VectorStoreError::ModelLoad(format!(
                "Model files for '{}' are missing. Expected ONNX at {} and tokenizer at {} (set RECALL_MODEL_DIR to point elsewhere).",
                spec.id,
                model_path.display(),
                tokenizer_path.display(),
            )));
        }

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| VectorStoreError::ModelLoad(format!("Tokenizer load failed: {e}")))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..PaddingParams::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: spec.max_length,
                ..TruncationParams::default()
            }))
            .map_err(|e| VectorStoreError::ModelLoad(format!("Tokenizer truncation failed: {e}")))?;

        let (intra_threads, inter_threads) = default_ort_threads();
        let session = Session::builder()
            .map_err(|e| to_model_load_error(&e))?
            .with_intra_threads(intra_threads)
            .map_err(|e| to_model_load_error(&e))?
            .with_inter_threads(inter_threads)
            .map_err(|e| to_model_load_error(&e))?
            .with_execution_providers(execution_providers(device))
            .map_err(|e| {
                VectorStoreError::ModelLoad(format!(
                    "Failed to register execution provider for {device}: {e}"
                ))
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| to_model_load_error(&e))?
            .commit_from_file(&model_path)
            .map_err(|e| VectorStoreError::ModelLoad(format!("Failed to load ONNX model: {e}")))?;

        log::info!(
            "Loaded ONNX model '{}' on {device} (dim {}, max_length {}, batch {})",
            spec.id,
            spec.dimension,
            spec.max_length,
            spec.max_batch
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_length: spec.max_length,
            max_batch: spec.max_batch,
            dimension: spec.dimension,
        })
    }

    fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch) {
            let encodings = self
                .tokenizer
                .encode_batch(batch.to_vec(), true)
                .map_err(|e| VectorStoreError::Embedding(format!("Tokenization failed: {e}")))?;
            if encodings.is_empty() {
                continue;
            }

            let seq_len = encodings[0].len();
            if seq_len > self.max_length {
                return Err(VectorStoreError::Embedding(format!(
                    "Tokenized length {seq_len} exceeds max_length {}",
                    self.max_length
                )));
            }
            if encodings.iter().any(|e| e.len() != seq_len) {
                return Err(VectorStoreError::Embedding(
                    "Inconsistent sequence lengths after padding".to_string(),
                ));
            }
            let (ids, masks, type_ids, mask_rows) = build_flat_tensors(&encodings, seq_len);

            let shape = (batch.len(), seq_len);
            let ids_array = Array::from_shape_vec(shape, ids)
                .map_err(|e| VectorStoreError::Embedding(format!("IDs shape error: {e}")))?;
            let mask_array = Array::from_shape_vec(shape, masks)
                .map_err(|e| VectorStoreError::Embedding(format!("Mask shape error: {e}")))?;
            let type_array = Array::from_shape_vec(shape, type_ids)
                .map_err(|e| VectorStoreError::Embedding(format!("Types shape error: {e}")))?;
            let ids_shape = ids_array.raw_dim().into_dyn();

            let mut available: HashMap<&'static str, DynTensor> = HashMap::new();
            available.insert(
                "input_ids",
                Tensor::from_array(ids_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );
            available.insert(
                "attention_mask",
                Tensor::from_array(mask_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );
            available.insert(
                "token_type_ids",
                Tensor::from_array(type_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );

            let array = {
                let mut session = self.session.lock().map_err(|_| {
                    VectorStoreError::Embedding("Failed to lock ONNX session".into())
                })?;

                let mut feed: HashMap<String, DynTensor> = HashMap::new();
                for input in &session.inputs {
                    let key = input.name.clone();
                    let value = match available.get(key.as_str()) {
                        Some(value) => value.clone(),
                        None => zero_tensor(&ids_shape, input)?,
                    };
                    feed.insert(key, value);
                }

                let outputs = session.run(SessionInputs::from(feed)).map_err(|e| {
                    VectorStoreError::Embedding(format!("ONNX forward failed: {e}"))
                })?;
                if outputs.len() == 0 {
                    return Err(VectorStoreError::Embedding(
                        "ONNX returned no outputs".to_string(),
                    ));
                }

                let array = outputs[0]
                    .try_extract_array::<f32>()
                    .map_err(|e| {
                        VectorStoreError::Embedding(format!("Failed to decode ONNX output: {e}"))
                    })?
                    .to_owned();
                drop(outputs);
                array
            };
            results.extend(embeddings_from_output(array, &mask_rows, self.dimension)?);
        }
        Ok(results)
    }
}

fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        Device::Cuda { device_id } => vec![CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()],
    }
}

fn default_ort_threads() -> (usize, usize) {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    let intra_threads = match cpus {
        0..=4 => 1,
        5..=12 => 2,
        _ => 4,
    };
    (intra_threads, 1)
}

fn ensure_dimension(vec: &[f32], expected: usize) -> Result<()> {
    if vec.len() != expected {
        return Err(VectorStoreError::InvalidDimension {
            expected,
            actual: vec.len(),
        });
    }
    Ok(())
}

fn embeddings_from_output(
    array: ndarray::ArrayD<f32>,
    mask_rows: &[Vec<i64>],
    expected_dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::new();
    match array.ndim() {
        // Already pooled: [batch, hidden].
        2 => {
            let embeddings = array
                .into_dimensionality::<Ix2>()
                .map_err(|e| VectorStoreError::Embedding(format!("Bad output shape: {e}")))?;
            for row in embeddings.outer_iter() {
                let mut emb = row.to_vec();
                ensure_dimension(&emb, expected_dimension)?;
                normalize(&mut emb);
                out.push(emb);
            }
        }
        // Token states: [batch, seq, hidden], mean-pooled under the attention mask.
        3 => {
            let hidden = array
                .into_dimensionality::<Ix3>()
                .map_err(|e| VectorStoreError::Embedding(format!("Bad output shape: {e}")))?;
            for (idx, sample) in hidden.outer_iter().enumerate() {
                let attn = mask_rows
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| vec![1; sample.len_of(Axis(0))]);
                let mut emb = mean_pool(sample, &attn);
                ensure_dimension(&emb, expected_dimension)?;
                normalize(&mut emb);
                out.push(emb);
            }
        }
        _ => {
            return Err(VectorStoreError::Embedding(format!(
                "Unexpected ONNX output dims: {:?}",
                array.shape()
            )));
        }
    }
    Ok(out)
}

fn mean_pool(sample: ndarray::ArrayView2<'_, f32>, mask: &[i64]) -> Vec<f32> {
    let hidden = sample.len_of(Axis(1));
    let mut sum = vec![0.0f32; hidden];
    let mut count = 0.0f32;

    for (token_idx, token) in sample.outer_iter().enumerate() {
        if mask.get(token_idx).copied().unwrap_or(0) == 0 {
            continue;
        }
        count += 1.0;
        for (dim, value) in token.iter().enumerate() {
            sum[dim] += value;
        }
    }

    if count > 0.0 {
        for value in &mut sum {
            *value /= count;
        }
    }
    sum
}

fn build_flat_tensors(
    encodings: &[Encoding],
    seq_len: usize,
) -> (Vec<i64>, Vec<i64>, Vec<i64>, Vec<Vec<i64>>) {
    let mut ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut masks = Vec::with_capacity(encodings.len() * seq_len);
    let mut type_ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut mask_rows = Vec::with_capacity(encodings.len());

    for encoding in encodings {
        let encoding_ids = encoding.get_ids();
        let encoding_masks = encoding.get_attention_mask();
        let encoding_types = encoding.get_type_ids();

        for idx in 0..seq_len {
            ids.push(i64::from(encoding_ids.get(idx).copied().unwrap_or(0)));
            masks.push(i64::from(encoding_masks.get(idx).copied().unwrap_or(0)));
            type_ids.push(i64::from(encoding_types.get(idx).copied().unwrap_or(0)));
        }
        mask_rows.push(
            encoding_masks
                .iter()
                .take(seq_len)
                .map(|v| i64::from(*v))
                .collect(),
        );
    }

    (ids, masks, type_ids, mask_rows)
}

fn zero_tensor(shape: &ndarray::IxDyn, input: &Input) -> Result<DynTensor> {
    let ort::value::ValueType::Tensor { ty, .. } = &input.input_type else {
        return Err(VectorStoreError::Embedding(format!(
            "Unsupported ONNX input '{}': not a tensor",
            input.name
        )));
    };
    let tensor = match ty {
        TensorElementType::Int64 => Tensor::from_array(Array::<i64, _>::zeros(shape.clone()))
            .map_err(|e| to_embedding_error(&e))?
            .upcast(),
        TensorElementType::Float32 => Tensor::from_array(Array::<f32, _>::zeros(shape.clone()))
            .map_err(|e| to_embedding_error(&e))?
            .upcast(),
        TensorElementType::Bool => Tensor::from_array(Array::from_elem(shape.clone(), false))
            .map_err(|e| to_embedding_error(&e))?
            .upcast(),
        other => {
            return Err(VectorStoreError::Embedding(format!(
                "Cannot synthesize zeros for tensor type {other:?} (input {})",
                input.name
            )))
        }
    };
    Ok(tensor)
}

pub(crate) fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vec {
        *value /= norm;
    }
}

fn stub_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut state =
        fnv1a_64(text.as_bytes()) ^ (dimension as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut vec = Vec::with_capacity(dimension);
    for _ in 0..dimension {
        let bits = splitmix64(&mut state);
        let mantissa = ((bits >> 32) as u32) >> 9;
        let unit = f32::from_bits(0x3f80_0000 | mantissa) - 1.0;
        vec.push(unit.mul_add(2.0, -1.0));
    }
    normalize(&mut vec);
    vec
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn to_embedding_error(error: &OrtError) -> VectorStoreError {
    VectorStoreError::Embedding(format!("{error}"))
}

fn to_model_load_error(error: &OrtError) -> VectorStoreError {
    VectorStoreError::ModelLoad(format!("{error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), body).expect("write manifest");
    }

    #[tokio::test]
    async fn stub_is_deterministic_and_normalized() {
        let stub = StubEmbedder::new("stub", 16);
        let a = stub.embed("hello").await.unwrap();
        let b = stub.embed("hello").await.unwrap();
        let c = stub.embed("world").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn stub_batch_preserves_order() {
        let stub = StubEmbedder::new("stub", 8);
        let out = stub
            .embed_batch(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![stub_embed("a", 8), stub_embed("b", 8)]);
    }

    #[test]
    fn model_ids_normalize() {
        assert_eq!(normalize_model_id("all-MiniLM-L6-v2"), "all-minilm-l6-v2");
        assert_eq!(
            normalize_model_id("sentence-transformers/all-MiniLM-L6-v2"),
            "all-minilm-l6-v2"
        );
        assert_eq!(normalize_model_id(" Custom "), "custom");
    }

    #[test]
    fn builtin_default_resolves_without_manifest() {
        let dir = TempDir::new().unwrap();
        let spec = resolve_model_spec(dir.path(), "all-MiniLM-L6-v2").unwrap();
        assert_eq!(spec, ModelSpec::builtin_default());
    }

    #[test]
    fn unknown_model_without_manifest_is_a_model_load_error() {
        let dir = TempDir::new().unwrap();
        let err = resolve_model_spec(dir.path(), "no-such-model").unwrap_err();
        assert!(matches!(err, VectorStoreError::ModelLoad(_)), "{err}");
    }

    #[test]
    fn manifest_lists_available_models_on_miss() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            r#"{"schema_version":1,"models":[{"id":"m1","dimension":8,"max_length":16,"max_batch":2}]}"#,
        );
        let err = resolve_model_spec(dir.path(), "m2").unwrap_err();
        assert!(err.to_string().contains("Available: m1"), "{err}");
    }

    #[test]
    fn manifest_assets_resolve_relative_paths() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            r#"{"schema_version":1,"models":[{"id":"m1","dimension":8,"max_length":16,"max_batch":2,
                "assets":[{"path":"m1/onnx/model.onnx"},{"path":"m1/tokenizer.json"}]}]}"#,
        );
        let spec = resolve_model_spec(dir.path(), "M1").unwrap();
        assert_eq!(spec.onnx_rel_path, PathBuf::from("onnx/model.onnx"));
        assert_eq!(spec.tokenizer_rel_path, PathBuf::from("tokenizer.json"));
        assert_eq!(spec.dimension, 8);
    }

    #[test]
    fn manifest_rejects_path_traversal_assets() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            r#"{"schema_version":1,"models":[{"id":"m1","dimension":8,"max_length":16,"max_batch":2,
                "assets":[{"path":"m1/../evil.onnx"}]}]}"#,
        );
        let err = resolve_model_spec(dir.path(), "m1").unwrap_err();
        assert!(
            err.to_string().contains("Invalid models manifest asset path"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn manifest_rejects_unknown_schema() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), r#"{"schema_version":9,"models":[]}"#);
        let err = resolve_model_spec(dir.path(), "m1").unwrap_err();
        assert!(err.to_string().contains("schema_version 9"), "{err}");
    }

    #[test]
    fn missing_model_files_fail_with_model_load() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            model_dir: Some(dir.path().to_path_buf()),
            ..StoreConfig::default()
        };
        let Err(err) = load_embedder(&config, Device::Cpu) else {
            panic!("expected missing model files to fail");
        };
        assert!(matches!(err, VectorStoreError::ModelLoad(_)), "{err}");
        assert!(err.to_string().contains("are missing"), "{err}");
    }

    #[test]
    fn mean_pool_ignores_masked_tokens() {
        let sample = ndarray::array![[1.0f32, 1.0], [3.0, 5.0], [100.0, 100.0]];
        let pooled = mean_pool(sample.view(), &[1, 1, 0]);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn pooled_output_is_checked_against_dimension() {
        let array = ndarray::Array::from_shape_vec((1, 3), vec![3.0f32, 0.0, 4.0])
            .unwrap()
            .into_dyn();
        let out = embeddings_from_output(array.clone(), &[], 3).unwrap();
        assert_eq!(out, vec![vec![0.6, 0.0, 0.8]]);

        let err = embeddings_from_output(array, &[], 4).unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::InvalidDimension {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    #[ignore = "Requires ONNX model download"]
    async fn onnx_embeds_with_configured_dimension() {
        let config = StoreConfig::from_env().unwrap();
        let embedder = load_embedder(&config, Device::Cpu).unwrap();
        let embedding = embedder.embed("hello world").await.unwrap();
        assert_eq!(embedding.len(), embedder.dimension());
    }
}
