mod engine;
mod error;

pub use codectx_core::{Chunk, Config, EmbeddingBackendKind, SymbolKind};
pub use embedding::{EmbeddingBackend, EmbeddingError};
pub use engine::{INDEX_DIR, IndexEngine};
pub use error::EngineError;
pub use index::{
  IndexOptions, IndexPhase, IndexProgress, IndexStats, IndexStatus, ProgressSender, StalenessReport,
};
pub use search::{SearchParams, SimilarHit, SimilarParams};
