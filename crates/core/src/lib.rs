mod chunk;
mod config;

pub use chunk::{Chunk, EmbeddedChunk, SymbolKind, ast_supported, canonical_language};
pub use config::{
  ChunkingConfig, Config, ConfigWarning, EmbeddingBackendKind, EmbeddingConfig, IndexingConfig, SearchConfig,
};
