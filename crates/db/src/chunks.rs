// Chunk table operations

use std::sync::Arc;

use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use codectx_core::{Chunk, EmbeddedChunk};
use futures::TryStreamExt;
use lancedb::{
  DistanceType,
  query::{ExecutableQuery, QueryBase},
};
use tracing::{debug, trace};

use crate::{
  connection::{CHUNKS_TABLE, DbError, IndexDb, Result},
  filter::filepath_filter,
  schema::chunks_schema,
};

impl IndexDb {
  /// Replace the chunk table wholesale: drop the existing table (if any) and
  /// create it from the given rows. Used by full reindex.
  #[tracing::instrument(level = "trace", skip(self, chunks), fields(rows = chunks.len()))]
  pub async fn create_chunk_table(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
    self.drop_table_if_exists(CHUNKS_TABLE).await?;

    debug!(table = CHUNKS_TABLE, rows = chunks.len(), "Creating chunk table");
    if chunks.is_empty() {
      self
        .connection
        .create_empty_table(CHUNKS_TABLE, chunks_schema(self.vector_dim))
        .execute()
        .await?;
      return Ok(());
    }

    let batch = chunks_to_batch(chunks, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema(self.vector_dim));
    self.connection.create_table(CHUNKS_TABLE, Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Append rows to the existing chunk table. Used by incremental update.
  #[tracing::instrument(level = "trace", skip(self, chunks), fields(rows = chunks.len()))]
  pub async fn append_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
    if chunks.is_empty() {
      return Ok(());
    }

    trace!(table = CHUNKS_TABLE, rows = chunks.len(), "Appending chunk batch");
    let table = self.chunks_table().await?;
    let batch = chunks_to_batch(chunks, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Delete all chunks belonging to one file.
  pub async fn delete_chunks_for_file(&self, filepath: &str) -> Result<()> {
    debug!(table = CHUNKS_TABLE, file = %filepath, "Deleting chunks for file");
    let table = self.chunks_table().await?;
    table.delete(&filepath_filter(filepath)?).await?;
    Ok(())
  }

  /// Live row count of the chunk table.
  pub async fn count_chunks(&self) -> Result<usize> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(None).await?)
  }

  /// Vector nearest-neighbor search, ordered by ascending cosine distance.
  pub async fn search_chunks(&self, query_vector: &[f32], limit: usize) -> Result<Vec<(Chunk, f32)>> {
    debug!(
      table = CHUNKS_TABLE,
      query_len = query_vector.len(),
      limit,
      "Searching chunks"
    );

    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .vector_search(query_vector.to_vec())?
      .distance_type(DistanceType::Cosine)
      .limit(limit)
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut hits = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        let chunk = batch_to_chunk(&batch, row)?;
        let distance = batch
          .column_by_name("_distance")
          .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
          .map(|arr| arr.value(row))
          .unwrap_or(0.0);
        hits.push((chunk, distance));
      }
    }

    debug!(table = CHUNKS_TABLE, results = hits.len(), "Search complete");
    Ok(hits)
  }

  /// Materialize chunk rows, optionally filtered and limited.
  #[tracing::instrument(level = "trace", skip(self), fields(has_filter = filter.is_some(), limit = ?limit))]
  pub async fn list_chunks(&self, filter: Option<&str>, limit: Option<usize>) -> Result<Vec<Chunk>> {
    let table = self.chunks_table().await?;

    let query = match (filter, limit) {
      (Some(f), Some(l)) => table.query().only_if(f).limit(l),
      (Some(f), None) => table.query().only_if(f),
      (None, Some(l)) => table.query().limit(l),
      (None, None) => table.query(),
    };

    let results: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut chunks = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, row)?);
      }
    }
    Ok(chunks)
  }

  /// Chunks of a single file, for inspection and tests.
  pub async fn chunks_for_file(&self, filepath: &str) -> Result<Vec<Chunk>> {
    self.list_chunks(Some(&filepath_filter(filepath)?), None).await
  }
}

/// Convert embedded chunks to a single Arrow RecordBatch (true batch insert)
fn chunks_to_batch(chunks: &[EmbeddedChunk], vector_dim: usize) -> Result<RecordBatch> {
  let n = chunks.len();

  let ids: Vec<&str> = chunks.iter().map(|c| c.chunk.id.as_str()).collect();
  let filepaths: Vec<&str> = chunks.iter().map(|c| c.chunk.filepath.as_str()).collect();
  let contents: Vec<&str> = chunks.iter().map(|c| c.chunk.content.as_str()).collect();
  let start_lines: Vec<u32> = chunks.iter().map(|c| c.chunk.start_line).collect();
  let end_lines: Vec<u32> = chunks.iter().map(|c| c.chunk.end_line).collect();
  let languages: Vec<&str> = chunks.iter().map(|c| c.chunk.language.as_str()).collect();
  let symbol_kinds: Vec<Option<&str>> = chunks.iter().map(|c| c.chunk.symbol_kind.map(|k| k.as_str())).collect();
  let symbol_names: Vec<Option<&str>> = chunks.iter().map(|c| c.chunk.symbol_name.as_deref()).collect();

  // Flatten all vectors into one contiguous array
  let mut all_vectors: Vec<f32> = Vec::with_capacity(n * vector_dim);
  for embedded in chunks {
    if embedded.embedding.len() != vector_dim {
      return Err(DbError::InvalidInput(format!(
        "embedding for {} has {} dimensions, store expects {}",
        embedded.chunk.id,
        embedded.embedding.len(),
        vector_dim
      )));
    }
    all_vectors.extend(&embedded.embedding);
  }

  let vector_values = Float32Array::from(all_vectors);
  let field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vector_list = FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(vector_values), None)?;

  let batch = RecordBatch::try_new(
    chunks_schema(vector_dim),
    vec![
      Arc::new(StringArray::from(ids)),
      Arc::new(StringArray::from(filepaths)),
      Arc::new(StringArray::from(contents)),
      Arc::new(UInt32Array::from(start_lines)),
      Arc::new(UInt32Array::from(end_lines)),
      Arc::new(StringArray::from(languages)),
      Arc::new(StringArray::from(symbol_kinds)),
      Arc::new(StringArray::from(symbol_names)),
      Arc::new(vector_list),
    ],
  )?;

  Ok(batch)
}

/// Convert a RecordBatch row back into a Chunk (embedding not materialized)
fn batch_to_chunk(batch: &RecordBatch, row: usize) -> Result<Chunk> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_string_opt = |name: &str| -> Option<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .and_then(|a| {
        if a.is_null(row) {
          None
        } else {
          Some(a.value(row).to_string())
        }
      })
      .filter(|s| !s.is_empty())
  };

  let get_u32 = |name: &str| -> Result<u32> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let symbol_kind = get_string_opt("symbol_kind").and_then(|s| s.parse().ok());

  Ok(Chunk {
    id: get_string("id")?,
    filepath: get_string("filepath")?,
    content: get_string("content")?,
    start_line: get_u32("start_line")?,
    end_line: get_u32("end_line")?,
    language: get_string("language")?,
    symbol_kind,
    symbol_name: get_string_opt("symbol_name"),
  })
}

#[cfg(test)]
mod tests {
  use codectx_core::SymbolKind;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn embedded(filepath: &str, content: &str, start: u32, end: u32, vector: Vec<f32>) -> EmbeddedChunk {
    EmbeddedChunk {
      chunk: Chunk::new(filepath, content, start, end, "rust"),
      embedding: vector,
    }
  }

  async fn open_db() -> (TempDir, IndexDb) {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    (temp, db)
  }

  #[tokio::test]
  async fn test_create_and_count() {
    let (_temp, db) = open_db().await;
    let chunks = vec![
      embedded("src/a.rs", "fn a() {}", 1, 1, vec![1.0, 0.0, 0.0, 0.0]),
      embedded("src/b.rs", "fn b() {}", 1, 1, vec![0.0, 1.0, 0.0, 0.0]),
    ];

    db.create_chunk_table(&chunks).await.unwrap();
    assert_eq!(db.count_chunks().await.unwrap(), 2);
    assert!(db.has_chunk_table().await.unwrap());
  }

  #[tokio::test]
  async fn test_create_empty_table() {
    let (_temp, db) = open_db().await;
    db.create_chunk_table(&[]).await.unwrap();
    assert_eq!(db.count_chunks().await.unwrap(), 0);
    assert!(db.has_chunk_table().await.unwrap());
  }

  #[tokio::test]
  async fn test_create_replaces_existing() {
    let (_temp, db) = open_db().await;
    db.create_chunk_table(&[embedded("a.rs", "x", 1, 1, vec![1.0, 0.0, 0.0, 0.0])])
      .await
      .unwrap();
    db.create_chunk_table(&[
      embedded("b.rs", "y", 1, 1, vec![0.0, 1.0, 0.0, 0.0]),
      embedded("c.rs", "z", 1, 1, vec![0.0, 0.0, 1.0, 0.0]),
    ])
    .await
    .unwrap();

    assert_eq!(db.count_chunks().await.unwrap(), 2);
    assert!(db.chunks_for_file("a.rs").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_append_and_delete_by_file() {
    let (_temp, db) = open_db().await;
    db.create_chunk_table(&[embedded("keep.rs", "fn k() {}", 1, 1, vec![1.0, 0.0, 0.0, 0.0])])
      .await
      .unwrap();
    db.append_chunks(&[
      embedded("gone.rs", "fn g1() {}", 1, 1, vec![0.0, 1.0, 0.0, 0.0]),
      embedded("gone.rs", "fn g2() {}", 2, 2, vec![0.0, 0.0, 1.0, 0.0]),
    ])
    .await
    .unwrap();
    assert_eq!(db.count_chunks().await.unwrap(), 3);

    db.delete_chunks_for_file("gone.rs").await.unwrap();
    assert_eq!(db.count_chunks().await.unwrap(), 1);
    assert_eq!(db.chunks_for_file("keep.rs").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_symbol_fields_roundtrip() {
    let (_temp, db) = open_db().await;
    let chunk = Chunk::new("src/auth.rs", "fn login() {}", 3, 5, "rust").with_symbol(SymbolKind::Function, "login");
    db.create_chunk_table(&[EmbeddedChunk {
      chunk: chunk.clone(),
      embedding: vec![1.0, 0.0, 0.0, 0.0],
    }])
    .await
    .unwrap();

    let stored = db.chunks_for_file("src/auth.rs").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0], chunk);
  }

  #[tokio::test]
  async fn test_vector_search_orders_by_distance() {
    let (_temp, db) = open_db().await;
    db.create_chunk_table(&[
      embedded("near.rs", "near", 1, 1, vec![1.0, 0.0, 0.0, 0.0]),
      embedded("far.rs", "far", 1, 1, vec![0.0, 1.0, 0.0, 0.0]),
    ])
    .await
    .unwrap();

    let hits = db.search_chunks(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0.filepath, "near.rs");
    assert!(hits[0].1 < hits[1].1, "nearer chunk should have smaller distance");
  }

  #[tokio::test]
  async fn test_dimension_mismatch_rejected() {
    let (_temp, db) = open_db().await;
    let result = db.create_chunk_table(&[embedded("a.rs", "x", 1, 1, vec![1.0, 0.0])]).await;
    assert!(matches!(result, Err(DbError::InvalidInput(_))));
  }

  #[tokio::test]
  async fn test_quoted_filepath_delete() {
    let (_temp, db) = open_db().await;
    db.create_chunk_table(&[embedded("it's.rs", "x", 1, 1, vec![1.0, 0.0, 0.0, 0.0])])
      .await
      .unwrap();
    db.delete_chunks_for_file("it's.rs").await.unwrap();
    assert_eq!(db.count_chunks().await.unwrap(), 0);
  }
}
