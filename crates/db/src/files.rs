// File metadata table operations
//
// One row per indexed file recording the mtime observed at indexing time.
// The table is rewritten atomically per indexing run (drop + create), so it
// always reflects exactly one successful run.

use std::sync::Arc;

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use tracing::debug;

use crate::{
  connection::{DbError, FILE_META_TABLE, IndexDb, Result},
  schema::file_meta_schema,
};

/// The as-indexed state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
  /// Path relative to the project root
  pub filepath: String,
  /// Modification time in Unix milliseconds observed when last indexed
  pub mtime_ms: i64,
}

impl IndexDb {
  /// Replace the file-metadata table with the given rows.
  #[tracing::instrument(level = "trace", skip(self, files), fields(rows = files.len()))]
  pub async fn replace_file_meta(&self, files: &[FileMeta]) -> Result<()> {
    self.drop_table_if_exists(FILE_META_TABLE).await?;

    debug!(table = FILE_META_TABLE, rows = files.len(), "Rewriting file metadata");
    if files.is_empty() {
      self
        .connection
        .create_empty_table(FILE_META_TABLE, file_meta_schema())
        .execute()
        .await?;
      return Ok(());
    }

    let batch = file_meta_to_batch(files)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], file_meta_schema());
    self
      .connection
      .create_table(FILE_META_TABLE, Box::new(batches))
      .execute()
      .await?;
    Ok(())
  }

  /// All stored file metadata rows.
  pub async fn list_file_meta(&self) -> Result<Vec<FileMeta>> {
    let table = self.file_meta_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut files = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        files.push(batch_to_file_meta(&batch, row)?);
      }
    }
    Ok(files)
  }

  pub async fn count_file_meta(&self) -> Result<usize> {
    let table = self.file_meta_table().await?;
    Ok(table.count_rows(None).await?)
  }
}

fn file_meta_to_batch(files: &[FileMeta]) -> Result<RecordBatch> {
  let filepaths: Vec<&str> = files.iter().map(|f| f.filepath.as_str()).collect();
  let mtimes: Vec<i64> = files.iter().map(|f| f.mtime_ms).collect();

  let batch = RecordBatch::try_new(
    file_meta_schema(),
    vec![
      Arc::new(StringArray::from(filepaths)),
      Arc::new(Int64Array::from(mtimes)),
    ],
  )?;
  Ok(batch)
}

fn batch_to_file_meta(batch: &RecordBatch, row: usize) -> Result<FileMeta> {
  let filepath = batch
    .column_by_name("filepath")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .map(|a| a.value(row).to_string())
    .ok_or_else(|| DbError::NotFound("filepath column".to_string()))?;

  let mtime_ms = batch
    .column_by_name("mtime")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("mtime column".to_string()))?;

  Ok(FileMeta { filepath, mtime_ms })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  async fn open_db() -> (TempDir, IndexDb) {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    (temp, db)
  }

  #[tokio::test]
  async fn test_replace_and_list() {
    let (_temp, db) = open_db().await;
    let files = vec![
      FileMeta {
        filepath: "src/a.rs".to_string(),
        mtime_ms: 1_000,
      },
      FileMeta {
        filepath: "src/b.rs".to_string(),
        mtime_ms: 2_000,
      },
    ];

    db.replace_file_meta(&files).await.unwrap();

    let mut stored = db.list_file_meta().await.unwrap();
    stored.sort_by(|a, b| a.filepath.cmp(&b.filepath));
    assert_eq!(stored, files);
    assert_eq!(db.count_file_meta().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_replace_overwrites_previous_run() {
    let (_temp, db) = open_db().await;
    db.replace_file_meta(&[FileMeta {
      filepath: "old.rs".to_string(),
      mtime_ms: 1,
    }])
    .await
    .unwrap();

    db.replace_file_meta(&[FileMeta {
      filepath: "new.rs".to_string(),
      mtime_ms: 2,
    }])
    .await
    .unwrap();

    let stored = db.list_file_meta().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].filepath, "new.rs");
  }

  #[tokio::test]
  async fn test_replace_with_empty_creates_table() {
    let (_temp, db) = open_db().await;
    db.replace_file_meta(&[]).await.unwrap();
    assert!(db.has_file_meta_table().await.unwrap());
    assert_eq!(db.count_file_meta().await.unwrap(), 0);
  }
}
