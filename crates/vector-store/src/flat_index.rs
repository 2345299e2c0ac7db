use crate::error::{Result, VectorStoreError};
use crate::persist::write_atomic;
use ndarray::{Array2, ArrayView1, Axis};
use std::cmp::Ordering;
use std::path::Path;

const INDEX_MAGIC: &[u8; 4] = b"RVI1";
pub const INDEX_FORMAT_VERSION: u32 = 1;
// magic + version + dimension + count
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Exact nearest-neighbour index over L2 distance. Row `i` is the `i`-th vector ever added.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dimension: usize,
    vectors: Array2<f32>,
}

impl FlatL2Index {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Array2::zeros((0, dimension)),
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len_of(Axis(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a vector and returns its position.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dimension(vector)?;
        let position = self.len();
        self.vectors
            .push_row(ArrayView1::from(vector))
            .map_err(|e| VectorStoreError::Index(format!("append failed: {e}")))?;
        Ok(position)
    }

    /// Returns up to `k` `(position, squared L2 distance)` pairs, nearest first.
    /// Equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .outer_iter()
            .enumerate()
            .map(|(position, row)| (position, squared_l2(row, query)))
            .collect();

        let by_distance =
            |a: &(usize, f32), b: &(usize, f32)| -> Ordering { a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)) };
        if k < scored.len() {
            scored.select_nth_unstable_by(k, by_distance);
            scored.truncate(k);
        }
        scored.sort_by(by_distance);
        Ok(scored)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let dim = self.dimension as u32;
        out.extend_from_slice(&dim.to_le_bytes());
        out.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.vectors {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decodes an index, rejecting anything whose dimension differs from `expected_dimension`.
    pub fn from_bytes(bytes: &[u8], expected_dimension: usize) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != INDEX_MAGIC {
            return Err(VectorStoreError::Format(
                "index file is missing the RVI1 header".to_string(),
            ));
        }
        let version = read_u32(bytes, 4);
        if version != INDEX_FORMAT_VERSION {
            return Err(VectorStoreError::Format(format!(
                "unsupported index format version {version} (expected {INDEX_FORMAT_VERSION})"
            )));
        }
        let dimension = read_u32(bytes, 8) as usize;
        if dimension != expected_dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: expected_dimension,
                actual: dimension,
            });
        }
        let count = usize::try_from(read_u64(bytes, 12))
            .map_err(|_| VectorStoreError::Format("index vector count overflows".to_string()))?;

        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected_len != Some(bytes.len()) {
            return Err(VectorStoreError::Format(format!(
                "index body length {} does not match {count} vectors of dimension {dimension}",
                bytes.len() - HEADER_LEN
            )));
        }

        let values: Vec<f32> = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let vectors = Array2::from_shape_vec((count, dimension), values)
            .map_err(|e| VectorStoreError::Format(format!("index shape error: {e}")))?;
        Ok(Self { dimension, vectors })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, self.to_bytes()).await?;
        log::debug!("Saved index ({} vectors) to {}", self.len(), path.display());
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>, expected_dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let index = Self::from_bytes(&bytes, expected_dimension)?;
        log::debug!("Loaded index ({} vectors) from {}", index.len(), path.display());
        Ok(index)
    }
}

fn squared_l2(row: ArrayView1<'_, f32>, query: &[f32]) -> f32 {
    row.iter()
        .zip(query)
        .map(|(a, b)| {
            let d = a - b;
            d * d
        })
        .sum()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
