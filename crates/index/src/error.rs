use db::DbError;
use embedding::EmbeddingError;
use thiserror::Error;

use crate::progress::IndexPhase;

#[derive(Debug, Error)]
pub enum IndexError {
  #[error("store error: {0}")]
  Db(#[from] DbError),
  #[error("embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("invalid glob pattern: {0}")]
  Pattern(String),
  #[error("checkpoint error: {0}")]
  Checkpoint(String),
  #[error("indexing failed during {phase}: {source}")]
  Failed {
    phase: IndexPhase,
    #[source]
    source: Box<IndexError>,
  },
}

impl IndexError {
  /// Tag an error with the phase it occurred in, so callers can decide
  /// whether to resume or restart. Already-tagged errors keep their phase.
  pub fn during(self, phase: IndexPhase) -> Self {
    match self {
      IndexError::Failed { .. } => self,
      other => IndexError::Failed {
        phase,
        source: Box::new(other),
      },
    }
  }

  /// The phase this failure was tagged with, if any.
  pub fn phase(&self) -> Option<IndexPhase> {
    match self {
      IndexError::Failed { phase, .. } => Some(*phase),
      _ => None,
    }
  }
}
