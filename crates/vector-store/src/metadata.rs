use crate::error::{Result, VectorStoreError};
use crate::persist::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const METADATA_SCHEMA_VERSION: u32 = 1;
pub const EMBEDDING_ID_KEY: &str = "embeddingID";

/// Caller-visible fields of one record. Always carries [`EMBEDDING_ID_KEY`].
pub type Fields = Map<String, Value>;

/// Describes which index a metadata file belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    pub dimension: usize,
    pub model_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMetadata {
    schema_version: u32,
    dimension: usize,
    model_id: String,
    entries: BTreeMap<usize, Fields>,
}

/// Index position ⇄ record mapping kept as one value, so both directions change together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    entries: BTreeMap<usize, Fields>,
    positions: HashMap<String, usize>,
}

impl MetadataTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn from_entries(entries: BTreeMap<usize, Fields>) -> Self {
        let positions = entries
            .iter()
            .filter_map(|(position, fields)| {
                fields
                    .get(EMBEDDING_ID_KEY)
                    .and_then(Value::as_str)
                    .map(|id| (id.to_string(), *position))
            })
            .collect();
        Self { entries, positions }
    }

    /// Records `id` at `position`. `fields` may carry anything; its `embeddingID` is replaced.
    pub fn insert(&mut self, position: usize, id: &str, mut fields: Fields) -> Result<()> {
        if self.entries.contains_key(&position) {
            return Err(VectorStoreError::Index(format!(
                "metadata already has an entry at position {position}"
            )));
        }
        if self.positions.contains_key(id) {
            return Err(VectorStoreError::Index(format!(
                "embedding id {id} is already recorded"
            )));
        }
        fields.insert(EMBEDDING_ID_KEY.to_string(), Value::String(id.to_string()));
        self.entries.insert(position, fields);
        self.positions.insert(id.to_string(), position);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn at(&self, position: usize) -> Option<&Fields> {
        self.entries.get(&position)
    }

    /// The id stored at `position`, if the entry exists and its id is a string.
    #[must_use]
    pub fn embedding_id_at(&self, position: usize) -> Option<&str> {
        self.at(position)?.get(EMBEDDING_ID_KEY)?.as_str()
    }

    #[must_use]
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Fields> {
        self.position_of(id).and_then(|position| self.at(position))
    }

    /// Highest recorded position plus one; zero for an empty table.
    #[must_use]
    pub fn end_position(&self) -> usize {
        self.entries.keys().next_back().map_or(0, |p| p + 1)
    }

    /// Drops every entry at or beyond `position`; returns how many were removed.
    pub fn truncate(&mut self, position: usize) -> usize {
        let stale = self.entries.split_off(&position);
        for fields in stale.values() {
            if let Some(id) = fields.get(EMBEDDING_ID_KEY).and_then(Value::as_str) {
                if self.positions.get(id).is_some_and(|p| *p >= position) {
                    self.positions.remove(id);
                }
            }
        }
        stale.len()
    }

    pub fn to_json(&self, header: &MetadataHeader) -> Result<Vec<u8>> {
        let persisted = PersistedMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            dimension: header.dimension,
            model_id: header.model_id.clone(),
            entries: self.entries.clone(),
        };
        Ok(serde_json::to_vec_pretty(&persisted)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<(Self, MetadataHeader)> {
        let persisted: PersistedMetadata = serde_json::from_slice(bytes)?;
        if persisted.schema_version != METADATA_SCHEMA_VERSION {
            return Err(VectorStoreError::Format(format!(
                "Unsupported metadata schema_version {} (expected {METADATA_SCHEMA_VERSION})",
                persisted.schema_version
            )));
        }
        let header = MetadataHeader {
            dimension: persisted.dimension,
            model_id: persisted.model_id,
        };
        Ok((Self::from_entries(persisted.entries), header))
    }

    pub async fn save(&self, path: impl AsRef<Path>, header: &MetadataHeader) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, self.to_json(header)?).await?;
        log::debug!("Saved metadata ({} entries) to {}", self.len(), path.display());
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<(Self, MetadataHeader)> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let loaded = Self::from_json(&bytes)?;
        log::debug!(
            "Loaded metadata ({} entries) from {}",
            loaded.0.len(),
            path.display()
        );
        Ok(loaded)
    }
}
