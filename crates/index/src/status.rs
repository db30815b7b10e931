//! Corruption and staleness detection.
//!
//! Corruption is a disagreement among the chunk table, the file-metadata
//! table, and the descriptor. Staleness is a disagreement between the
//! file-metadata table and the current filesystem.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use db::IndexDb;
use tracing::debug;

use crate::{
  descriptor::{DescriptorStore, metadata_checksum},
  error::IndexError,
  scanner::Scanner,
};

#[derive(Debug, Clone)]
pub struct IndexStatus {
  pub indexed: bool,
  pub file_count: usize,
  pub chunk_count: usize,
  pub last_updated: Option<DateTime<Utc>>,
  pub index_path: String,
  pub embedding_backend: Option<String>,
  pub corrupted: bool,
  pub corruption_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessReport {
  pub stale: bool,
  pub reason: Option<String>,
}

impl StalenessReport {
  fn stale(reason: impl Into<String>) -> Self {
    Self {
      stale: true,
      reason: Some(reason.into()),
    }
  }

  fn fresh() -> Self {
    Self {
      stale: false,
      reason: None,
    }
  }
}

/// Observed index status. Never fails: store errors degrade to defaults.
pub async fn get_status(db: &IndexDb, descriptors: &DescriptorStore) -> IndexStatus {
  let index_path = db.path().display().to_string();

  let indexed = db.has_chunk_table().await.unwrap_or(false);
  if !indexed {
    return IndexStatus {
      indexed: false,
      file_count: 0,
      chunk_count: 0,
      last_updated: None,
      index_path,
      embedding_backend: None,
      corrupted: false,
      corruption_reason: None,
    };
  }

  let live_chunks = db.count_chunks().await.unwrap_or(0);

  let Some(descriptor) = descriptors.load() else {
    let file_count = db.count_file_meta().await.unwrap_or(0);
    return IndexStatus {
      indexed: true,
      file_count,
      chunk_count: live_chunks,
      last_updated: None,
      index_path,
      embedding_backend: None,
      corrupted: true,
      corruption_reason: Some("Missing index metadata".to_string()),
    };
  };

  let mut corrupted = false;
  let mut corruption_reason = None;

  if descriptor.chunk_count != live_chunks {
    corrupted = true;
    corruption_reason = Some(format!(
      "Chunk count mismatch: descriptor records {} but table holds {}",
      descriptor.chunk_count, live_chunks
    ));
  } else if let Some(expected) = &descriptor.checksum {
    let pairs: Vec<(String, i64)> = db
      .list_file_meta()
      .await
      .map(|rows| rows.into_iter().map(|m| (m.filepath, m.mtime_ms)).collect())
      .unwrap_or_default();
    let actual = metadata_checksum(&pairs);
    if &actual != expected {
      corrupted = true;
      corruption_reason = Some("File metadata checksum mismatch".to_string());
    }
  }

  debug!(chunks = live_chunks, corrupted, "Computed index status");

  IndexStatus {
    indexed: true,
    file_count: descriptor.file_count,
    chunk_count: live_chunks,
    last_updated: Some(descriptor.last_updated),
    index_path,
    embedding_backend: Some(descriptor.embedding_backend),
    corrupted,
    corruption_reason,
  }
}

/// Compare stored file metadata against the live filesystem. The first
/// triggering category (new, deleted, modified) names the reason.
pub async fn check_staleness(db: &IndexDb, scanner: &Scanner) -> Result<StalenessReport, IndexError> {
  if !db.has_chunk_table().await? {
    return Ok(StalenessReport::stale("Index does not exist"));
  }
  if !db.has_file_meta_table().await? {
    return Ok(StalenessReport::stale("No file metadata stored"));
  }

  let current = scanner.enumerate()?;
  let stored: HashMap<String, i64> = db
    .list_file_meta()
    .await?
    .into_iter()
    .map(|m| (m.filepath, m.mtime_ms))
    .collect();

  for file in &current {
    if !stored.contains_key(&file.relative_path) {
      return Ok(StalenessReport::stale(format!("new file: {}", file.relative_path)));
    }
  }

  let current_paths: HashSet<&str> = current.iter().map(|f| f.relative_path.as_str()).collect();
  let mut stored_paths: Vec<&String> = stored.keys().collect();
  stored_paths.sort();
  for path in stored_paths {
    if !current_paths.contains(path.as_str()) {
      return Ok(StalenessReport::stale(format!("deleted file: {}", path)));
    }
  }

  for file in &current {
    if let Some(&stored_mtime) = stored.get(&file.relative_path)
      && file.mtime_ms > stored_mtime
    {
      return Ok(StalenessReport::stale(format!("modified file: {}", file.relative_path)));
    }
  }

  Ok(StalenessReport::fresh())
}

#[cfg(test)]
mod tests {
  use codectx_core::{Chunk, EmbeddedChunk};
  use db::FileMeta;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;
  use crate::descriptor::IndexDescriptor;

  async fn indexed_db(index_dir: &std::path::Path, chunk_count: usize) -> IndexDb {
    let db = IndexDb::open(index_dir, 4).await.unwrap();
    let chunks: Vec<EmbeddedChunk> = (0..chunk_count)
      .map(|i| EmbeddedChunk {
        chunk: Chunk::new(format!("f{}.rs", i), format!("fn f{}() {{}}", i), 1, 1, "rust"),
        embedding: vec![1.0, 0.0, 0.0, 0.0],
      })
      .collect();
    db.create_chunk_table(&chunks).await.unwrap();
    db
  }

  fn descriptor_for(chunk_count: usize, checksum: Option<String>) -> IndexDescriptor {
    IndexDescriptor::new(1, chunk_count, "ollama", "nomic-embed-text", 4, checksum)
  }

  #[tokio::test]
  async fn test_status_unindexed() {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    let descriptors = DescriptorStore::new(temp.path());

    let status = get_status(&db, &descriptors).await;
    assert!(!status.indexed);
    assert!(!status.corrupted);
    assert_eq!(status.chunk_count, 0);
  }

  #[tokio::test]
  async fn test_status_missing_descriptor_is_corrupted() {
    let temp = TempDir::new().unwrap();
    let db = indexed_db(temp.path(), 1).await;
    let descriptors = DescriptorStore::new(temp.path());

    let status = get_status(&db, &descriptors).await;
    assert!(status.indexed);
    assert!(status.corrupted);
    assert_eq!(status.corruption_reason.as_deref(), Some("Missing index metadata"));
  }

  #[tokio::test]
  async fn test_status_chunk_count_mismatch() {
    let temp = TempDir::new().unwrap();
    let db = indexed_db(temp.path(), 1).await;
    let descriptors = DescriptorStore::new(temp.path());
    descriptors.save(&descriptor_for(5, None)).unwrap();

    let status = get_status(&db, &descriptors).await;
    assert!(status.corrupted);
    let reason = status.corruption_reason.unwrap();
    assert!(reason.contains("Chunk count mismatch"), "reason: {}", reason);
  }

  #[tokio::test]
  async fn test_status_checksum_mismatch() {
    let temp = TempDir::new().unwrap();
    let db = indexed_db(temp.path(), 1).await;
    db.replace_file_meta(&[FileMeta {
      filepath: "f0.rs".to_string(),
      mtime_ms: 111,
    }])
    .await
    .unwrap();

    let descriptors = DescriptorStore::new(temp.path());
    descriptors
      .save(&descriptor_for(1, Some("not-the-right-checksum".to_string())))
      .unwrap();

    let status = get_status(&db, &descriptors).await;
    assert!(status.corrupted);
    assert_eq!(
      status.corruption_reason.as_deref(),
      Some("File metadata checksum mismatch")
    );
  }

  #[tokio::test]
  async fn test_status_healthy() {
    let temp = TempDir::new().unwrap();
    let db = indexed_db(temp.path(), 2).await;
    let metas = vec![
      FileMeta {
        filepath: "f0.rs".to_string(),
        mtime_ms: 1,
      },
      FileMeta {
        filepath: "f1.rs".to_string(),
        mtime_ms: 2,
      },
    ];
    db.replace_file_meta(&metas).await.unwrap();

    let pairs: Vec<(String, i64)> = metas.iter().map(|m| (m.filepath.clone(), m.mtime_ms)).collect();
    let descriptors = DescriptorStore::new(temp.path());
    descriptors
      .save(&descriptor_for(2, Some(metadata_checksum(&pairs))))
      .unwrap();

    let status = get_status(&db, &descriptors).await;
    assert!(status.indexed);
    assert!(!status.corrupted, "reason: {:?}", status.corruption_reason);
    assert_eq!(status.chunk_count, 2);
    assert_eq!(status.embedding_backend.as_deref(), Some("ollama"));
  }

  fn project_scanner(project: &std::path::Path) -> Scanner {
    Scanner::new(project, &["**/*.rs".to_string()], &[]).unwrap()
  }

  #[tokio::test]
  async fn test_stale_no_index() {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    let report = check_staleness(&db, &project_scanner(temp.path())).await.unwrap();
    assert_eq!(report, StalenessReport::stale("Index does not exist"));
  }

  #[tokio::test]
  async fn test_stale_no_file_metadata() {
    let temp = TempDir::new().unwrap();
    let db = indexed_db(temp.path(), 1).await;
    let report = check_staleness(&db, &project_scanner(temp.path())).await.unwrap();
    assert_eq!(report, StalenessReport::stale("No file metadata stored"));
  }

  #[tokio::test]
  async fn test_stale_new_file() {
    let project = TempDir::new().unwrap();
    let index = TempDir::new().unwrap();
    std::fs::write(project.path().join("fresh.rs"), "fn f() {}").unwrap();

    let db = indexed_db(index.path(), 1).await;
    db.replace_file_meta(&[]).await.unwrap();

    let report = check_staleness(&db, &project_scanner(project.path())).await.unwrap();
    assert!(report.stale);
    assert!(report.reason.unwrap().contains("new file: fresh.rs"));
  }

  #[tokio::test]
  async fn test_stale_deleted_file() {
    let project = TempDir::new().unwrap();
    let index = TempDir::new().unwrap();

    let db = indexed_db(index.path(), 1).await;
    db.replace_file_meta(&[FileMeta {
      filepath: "vanished.rs".to_string(),
      mtime_ms: 1,
    }])
    .await
    .unwrap();

    let report = check_staleness(&db, &project_scanner(project.path())).await.unwrap();
    assert!(report.stale);
    assert!(report.reason.unwrap().contains("deleted file: vanished.rs"));
  }

  #[tokio::test]
  async fn test_stale_modified_file() {
    let project = TempDir::new().unwrap();
    let index = TempDir::new().unwrap();
    let file = project.path().join("code.rs");
    std::fs::write(&file, "fn f() {}").unwrap();

    let scanner = project_scanner(project.path());
    let current = scanner.enumerate().unwrap();

    let db = indexed_db(index.path(), 1).await;
    db.replace_file_meta(&[FileMeta {
      filepath: "code.rs".to_string(),
      mtime_ms: current[0].mtime_ms - 5_000,
    }])
    .await
    .unwrap();

    let report = check_staleness(&db, &scanner).await.unwrap();
    assert!(report.stale);
    assert!(report.reason.unwrap().contains("modified file: code.rs"));
  }

  #[tokio::test]
  async fn test_not_stale_when_in_sync() {
    let project = TempDir::new().unwrap();
    let index = TempDir::new().unwrap();
    std::fs::write(project.path().join("code.rs"), "fn f() {}").unwrap();

    let scanner = project_scanner(project.path());
    let current = scanner.enumerate().unwrap();

    let db = indexed_db(index.path(), 1).await;
    db.replace_file_meta(&[FileMeta {
      filepath: "code.rs".to_string(),
      mtime_ms: current[0].mtime_ms,
    }])
    .await
    .unwrap();

    let report = check_staleness(&db, &scanner).await.unwrap();
    assert!(!report.stale, "reason: {:?}", report.reason);
  }
}
