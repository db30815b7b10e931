use db::DbError;
use embedding::EmbeddingError;
use index::IndexError;
use search::SearchError;

/// Unified error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error(transparent)]
  Index(#[from] IndexError),
  #[error(transparent)]
  Search(#[from] SearchError),
  #[error(transparent)]
  Store(#[from] DbError),
  #[error(transparent)]
  Embedding(#[from] EmbeddingError),
}

impl EngineError {
  /// Whether this is the recoverable "search before index" condition.
  pub fn is_not_indexed(&self) -> bool {
    matches!(self, EngineError::Search(SearchError::NotIndexed))
  }
}
