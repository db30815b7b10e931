//! The persisted index descriptor (`index-metadata.json`).
//!
//! Written at the end of every successful indexing run; the corruption
//! detector compares it against live store state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::IndexError;

pub const DESCRIPTOR_FILE: &str = "index-metadata.json";
pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
  pub last_updated: DateTime<Utc>,
  pub file_count: usize,
  pub chunk_count: usize,
  pub embedding_backend: String,
  pub embedding_model: String,
  pub embedding_dimensions: usize,
  pub version: u32,
  /// Stable hash over the sorted (filepath, mtime) pairs
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checksum: Option<String>,
}

impl IndexDescriptor {
  pub fn new(
    file_count: usize,
    chunk_count: usize,
    backend: &str,
    model: &str,
    dimensions: usize,
    checksum: Option<String>,
  ) -> Self {
    Self {
      last_updated: Utc::now(),
      file_count,
      chunk_count,
      embedding_backend: backend.to_string(),
      embedding_model: model.to_string(),
      embedding_dimensions: dimensions,
      version: DESCRIPTOR_VERSION,
      checksum,
    }
  }
}

/// Stable hash over the sorted list of (filepath, mtime) pairs.
pub fn metadata_checksum(entries: &[(String, i64)]) -> String {
  let mut sorted: Vec<&(String, i64)> = entries.iter().collect();
  sorted.sort();

  let mut hasher = Sha256::new();
  for (filepath, mtime) in sorted {
    hasher.update(filepath.as_bytes());
    hasher.update(b":");
    hasher.update(mtime.to_le_bytes());
    hasher.update(b"\n");
  }
  hex::encode(hasher.finalize())
}

/// Load/save/delete for the descriptor file.
pub struct DescriptorStore {
  path: PathBuf,
}

impl DescriptorStore {
  pub fn new(index_dir: &Path) -> Self {
    Self {
      path: index_dir.join(DESCRIPTOR_FILE),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn exists(&self) -> bool {
    self.path.exists()
  }

  /// Load the descriptor if present and parseable.
  pub fn load(&self) -> Option<IndexDescriptor> {
    if !self.path.exists() {
      return None;
    }

    let content = match std::fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) => {
        warn!(path = %self.path.display(), err = %e, "Failed to read index descriptor");
        return None;
      }
    };

    match serde_json::from_str(&content) {
      Ok(descriptor) => Some(descriptor),
      Err(e) => {
        warn!(path = %self.path.display(), err = %e, "Corrupt index descriptor");
        None
      }
    }
  }

  pub fn save(&self, descriptor: &IndexDescriptor) -> Result<(), IndexError> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json =
      serde_json::to_string_pretty(descriptor).map_err(|e| IndexError::Checkpoint(format!("serialize: {}", e)))?;
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &self.path)?;
    debug!(path = %self.path.display(), "Wrote index descriptor");
    Ok(())
  }

  pub fn delete(&self) {
    if self.path.exists()
      && let Err(e) = std::fs::remove_file(&self.path)
    {
      warn!(path = %self.path.display(), err = %e, "Failed to delete descriptor");
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn test_save_load_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = DescriptorStore::new(temp.path());

    let descriptor = IndexDescriptor::new(3, 12, "ollama", "nomic-embed-text", 768, Some("abc".to_string()));
    store.save(&descriptor).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.file_count, 3);
    assert_eq!(loaded.chunk_count, 12);
    assert_eq!(loaded.embedding_dimensions, 768);
    assert_eq!(loaded.checksum.as_deref(), Some("abc"));
    assert_eq!(loaded.version, DESCRIPTOR_VERSION);
  }

  #[test]
  fn test_camel_case_on_disk() {
    let temp = TempDir::new().unwrap();
    let store = DescriptorStore::new(temp.path());
    store
      .save(&IndexDescriptor::new(1, 1, "ollama", "m", 4, None))
      .unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"lastUpdated\""), "raw: {}", raw);
    assert!(raw.contains("\"embeddingDimensions\""));
    assert!(raw.contains("\"chunkCount\""));
  }

  #[test]
  fn test_checksum_is_order_independent() {
    let a = vec![("a.rs".to_string(), 1i64), ("b.rs".to_string(), 2)];
    let b = vec![("b.rs".to_string(), 2i64), ("a.rs".to_string(), 1)];
    assert_eq!(metadata_checksum(&a), metadata_checksum(&b));
  }

  #[test]
  fn test_checksum_changes_with_mtime() {
    let a = vec![("a.rs".to_string(), 1i64)];
    let b = vec![("a.rs".to_string(), 2i64)];
    assert_ne!(metadata_checksum(&a), metadata_checksum(&b));
  }

  #[test]
  fn test_missing_descriptor_loads_none() {
    let temp = TempDir::new().unwrap();
    let store = DescriptorStore::new(temp.path());
    assert!(store.load().is_none());
  }
}
