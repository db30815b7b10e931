use std::path::{Path, PathBuf};

use lancedb::{Connection, connect};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Invalid input: {0}")]
  InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub const CHUNKS_TABLE: &str = "code_chunks";
pub const FILE_META_TABLE: &str = "file_metadata";

/// Connection to the on-disk vector store of a single project index.
///
/// Opened once at startup and shared for the process lifetime. The indexing
/// orchestrator is the only writer; searches read concurrently.
pub struct IndexDb {
  pub connection: Connection,
  pub vector_dim: usize,
  db_path: PathBuf,
}

impl IndexDb {
  /// Open (or create) the store under the index directory.
  pub async fn open(index_dir: &Path, vector_dim: usize) -> Result<Self> {
    let db_path = index_dir.join("lancedb");
    Self::open_at_path(db_path, vector_dim).await
  }

  /// Open the store at an explicit path.
  pub async fn open_at_path(db_path: PathBuf, vector_dim: usize) -> Result<Self> {
    if let Some(parent) = db_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    info!(path = %db_path.display(), vector_dim, "Opening vector store");
    let connection = match connect(db_path.to_string_lossy().as_ref()).execute().await {
      Ok(conn) => {
        debug!(path = %db_path.display(), "Vector store connection established");
        conn
      }
      Err(e) => {
        error!(path = %db_path.display(), err = %e, "Failed to open vector store");
        return Err(e.into());
      }
    };

    Ok(Self {
      connection,
      vector_dim,
      db_path,
    })
  }

  pub fn path(&self) -> &Path {
    &self.db_path
  }

  pub async fn table_names(&self) -> Result<Vec<String>> {
    Ok(self.connection.table_names().execute().await?)
  }

  /// Whether the chunk table exists — the definition of "indexed".
  pub async fn has_chunk_table(&self) -> Result<bool> {
    Ok(self.table_names().await?.contains(&CHUNKS_TABLE.to_string()))
  }

  pub async fn has_file_meta_table(&self) -> Result<bool> {
    Ok(self.table_names().await?.contains(&FILE_META_TABLE.to_string()))
  }

  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(CHUNKS_TABLE).execute().await?)
  }

  pub async fn file_meta_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(FILE_META_TABLE).execute().await?)
  }

  /// Drop a table if it exists; missing tables are not an error.
  pub async fn drop_table_if_exists(&self, name: &str) -> Result<()> {
    if self.table_names().await?.contains(&name.to_string()) {
      debug!(table = name, "Dropping table");
      self.connection.drop_table(name, &[]).await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[tokio::test]
  async fn test_open_creates_store() {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    assert_eq!(db.vector_dim, 4);
    assert!(db.table_names().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_no_tables_means_not_indexed() {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    assert!(!db.has_chunk_table().await.unwrap());
    assert!(!db.has_file_meta_table().await.unwrap());
  }

  #[tokio::test]
  async fn test_drop_missing_table_is_noop() {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(temp.path(), 4).await.unwrap();
    db.drop_table_if_exists(CHUNKS_TABLE).await.unwrap();
  }
}
