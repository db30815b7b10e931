//! Resumable-checkpoint protocol for interrupted indexing runs.
//!
//! The checkpoint lives at `<index-dir>/checkpoint.json` only while a run is
//! in flight. Phase transitions update it; success deletes it. A checkpoint
//! written by a different backend/model combination is incompatible and gets
//! discarded on load.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use codectx_core::{Chunk, EmbeddedChunk};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IndexError;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPhase {
  /// Files are being read and chunked; chunks have no embeddings yet
  Chunking,
  /// Chunks are being embedded batch by batch
  Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
  pub phase: CheckpointPhase,
  pub started_at: DateTime<Utc>,
  /// Absolute paths of the files being processed this run
  pub files: Vec<String>,
  /// Relative paths already chunked
  pub processed_files: Vec<String>,
  /// Chunks awaiting embedding (chunking phase only)
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub pending_chunks: Vec<Chunk>,
  /// Chunks with embeddings attached (embedding phase only)
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub embedded_chunks: Vec<EmbeddedChunk>,
  pub embedding_backend: String,
  pub embedding_model: String,
  /// Relative path -> mtime (Unix ms) observed at chunk time
  pub file_mtimes: BTreeMap<String, i64>,
}

impl Checkpoint {
  pub fn new(phase: CheckpointPhase, backend: &str, model: &str, files: Vec<String>) -> Self {
    Self {
      phase,
      started_at: Utc::now(),
      files,
      processed_files: Vec::new(),
      pending_chunks: Vec::new(),
      embedded_chunks: Vec::new(),
      embedding_backend: backend.to_string(),
      embedding_model: model.to_string(),
      file_mtimes: BTreeMap::new(),
    }
  }

  /// A checkpoint only resumes under the same backend and model.
  pub fn is_compatible(&self, backend: &str, model: &str) -> bool {
    self.embedding_backend == backend && self.embedding_model == model
  }
}

/// Load/save/delete for the checkpoint file.
pub struct CheckpointStore {
  path: PathBuf,
}

impl CheckpointStore {
  pub fn new(index_dir: &Path) -> Self {
    Self {
      path: index_dir.join(CHECKPOINT_FILE),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn exists(&self) -> bool {
    self.path.exists()
  }

  /// Load the checkpoint if present. Unreadable or corrupt files are
  /// discarded with a warning rather than surfaced.
  pub fn load(&self) -> Option<Checkpoint> {
    if !self.path.exists() {
      return None;
    }

    let content = match std::fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) => {
        warn!(path = %self.path.display(), err = %e, "Failed to read checkpoint, discarding");
        self.delete();
        return None;
      }
    };

    match serde_json::from_str(&content) {
      Ok(checkpoint) => {
        debug!(path = %self.path.display(), "Loaded checkpoint");
        Some(checkpoint)
      }
      Err(e) => {
        warn!(path = %self.path.display(), err = %e, "Corrupt checkpoint, discarding");
        self.delete();
        None
      }
    }
  }

  /// Write the checkpoint atomically (temp file + rename).
  pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), IndexError> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json =
      serde_json::to_string_pretty(checkpoint).map_err(|e| IndexError::Checkpoint(format!("serialize: {}", e)))?;
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &self.path)?;
    Ok(())
  }

  pub fn delete(&self) {
    if self.path.exists()
      && let Err(e) = std::fs::remove_file(&self.path)
    {
      warn!(path = %self.path.display(), err = %e, "Failed to delete checkpoint");
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn sample_checkpoint() -> Checkpoint {
    let mut checkpoint = Checkpoint::new(
      CheckpointPhase::Chunking,
      "ollama",
      "nomic-embed-text",
      vec!["/project/src/a.py".to_string()],
    );
    checkpoint.pending_chunks = vec![Chunk::new("src/a.py", "def f(): pass", 1, 1, "python")];
    checkpoint.processed_files = vec!["src/a.py".to_string()];
    checkpoint.file_mtimes.insert("src/a.py".to_string(), 1234);
    checkpoint
  }

  #[test]
  fn test_save_load_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    let checkpoint = sample_checkpoint();

    store.save(&checkpoint).unwrap();
    assert!(store.exists());

    let loaded = store.load().unwrap();
    assert_eq!(loaded.phase, CheckpointPhase::Chunking);
    assert_eq!(loaded.pending_chunks.len(), 1);
    assert_eq!(loaded.file_mtimes.get("src/a.py"), Some(&1234));
  }

  #[test]
  fn test_camel_case_on_disk() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    store.save(&sample_checkpoint()).unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"embeddingBackend\""), "raw: {}", raw);
    assert!(raw.contains("\"fileMtimes\""));
    assert!(raw.contains("\"processedFiles\""));
    assert!(raw.contains("\"pendingChunks\""));
  }

  #[test]
  fn test_embedded_chunks_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());

    let mut checkpoint = Checkpoint::new(CheckpointPhase::Embedding, "ollama", "nomic-embed-text", vec![]);
    checkpoint.embedded_chunks = vec![EmbeddedChunk {
      chunk: Chunk::new("src/a.py", "def f(): pass", 1, 1, "python"),
      embedding: vec![0.25, 0.5],
    }];
    store.save(&checkpoint).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.phase, CheckpointPhase::Embedding);
    assert_eq!(loaded.embedded_chunks[0].embedding, vec![0.25, 0.5]);
  }

  #[test]
  fn test_compatibility() {
    let checkpoint = sample_checkpoint();
    assert!(checkpoint.is_compatible("ollama", "nomic-embed-text"));
    assert!(!checkpoint.is_compatible("openai", "nomic-embed-text"));
    assert!(!checkpoint.is_compatible("ollama", "other-model"));
  }

  #[test]
  fn test_corrupt_checkpoint_discarded() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    std::fs::write(store.path(), "{ not json").unwrap();

    assert!(store.load().is_none());
    assert!(!store.exists(), "corrupt file is deleted");
  }

  #[test]
  fn test_delete_missing_is_noop() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    store.delete();
  }
}
