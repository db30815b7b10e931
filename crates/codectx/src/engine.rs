//! The engine facade: one initialized instance per project, exposing
//! indexing, search, status, and maintenance over shared process-wide state.
//!
//! The vector store connection opens at startup and lives for the process.
//! Indexing holds exclusive write access; searches read concurrently.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use codectx_core::{Chunk, Config};
use db::{CHUNKS_TABLE, IndexDb};
use embedding::EmbeddingBackend;
use index::{
  IndexOptions, IndexStats, IndexStatus, Indexer, ProgressSender, Scanner, StalenessReport, check_staleness,
  get_status,
};
use search::{QueryCache, RankingWeights, SearchParams, SimilarHit, SimilarParams};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Project-root-relative directory holding the vector store, descriptor, and
/// checkpoint.
pub const INDEX_DIR: &str = ".index";

pub struct IndexEngine {
  project_root: PathBuf,
  config: Arc<Config>,
  db: Arc<IndexDb>,
  backend: Arc<dyn EmbeddingBackend>,
  indexer: Indexer,
  query_cache: QueryCache,
}

impl IndexEngine {
  /// Open the store, load config, and probe the configured backend.
  pub async fn initialize(project_root: impl AsRef<Path>) -> Result<Self, EngineError> {
    let project_root = project_root.as_ref().to_path_buf();
    let config = Arc::new(Config::load_for_project(&project_root));
    let backend = <dyn EmbeddingBackend>::from_config(&config.embedding)?;
    backend.initialize().await?;
    Self::with_backend(project_root, config, backend).await
  }

  /// Construct with an explicit backend (no reachability probe). The entry
  /// point for embedding into hosts that manage their own backends, and for
  /// tests.
  pub async fn with_backend(
    project_root: impl AsRef<Path>,
    config: Arc<Config>,
    backend: Arc<dyn EmbeddingBackend>,
  ) -> Result<Self, EngineError> {
    let project_root = project_root.as_ref().to_path_buf();
    let index_dir = project_root.join(INDEX_DIR);
    let db = Arc::new(IndexDb::open(&index_dir, backend.dimensions()).await?);
    let indexer = Indexer::new(&project_root, &index_dir, config.clone(), db.clone(), backend.clone());

    info!(
      project = %project_root.display(),
      backend = backend.name(),
      model = backend.model(),
      dimensions = backend.dimensions(),
      "Engine initialized"
    );

    Ok(Self {
      project_root,
      config,
      db,
      backend,
      indexer,
      query_cache: QueryCache::new(),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn project_root(&self) -> &Path {
    &self.project_root
  }

  /// Run a full or incremental indexing pass (see [`IndexOptions`]).
  pub async fn index_codebase(
    &self,
    options: &IndexOptions,
    progress: Option<ProgressSender>,
  ) -> Result<IndexStats, EngineError> {
    Ok(self.indexer.index_codebase(options, progress).await?)
  }

  /// Hybrid ranked search. Fails with a recoverable not-indexed condition
  /// when no chunk table exists.
  pub async fn search(&self, params: &SearchParams) -> Result<Vec<Chunk>, EngineError> {
    self.auto_reindex_if_stale().await;

    let weights = RankingWeights {
      semantic: self.config.search.semantic_weight,
      keyword: self.config.search.keyword_weight,
    };
    Ok(search::search(&self.db, &self.backend, &self.query_cache, weights, params).await?)
  }

  /// Find chunks similar to a code snippet or file range, annotated with
  /// similarity in [0, 1].
  pub async fn search_similar(&self, params: &SimilarParams) -> Result<Vec<SimilarHit>, EngineError> {
    Ok(search::search_similar(&self.db, &self.backend, &self.project_root, params).await?)
  }

  /// Observed index status; never fails.
  pub async fn get_status(&self) -> IndexStatus {
    get_status(&self.db, self.indexer.descriptors()).await
  }

  /// Compare stored file metadata against the current filesystem.
  pub async fn check_if_stale(&self) -> Result<StalenessReport, EngineError> {
    let scanner = Scanner::new(&self.project_root, &self.config.patterns, &self.config.exclude_patterns)?;
    Ok(check_staleness(&self.db, &scanner).await?)
  }

  /// Drop the chunk table, clear the query cache, and delete any checkpoint.
  pub async fn clear_index(&self) -> Result<(), EngineError> {
    info!("Clearing index");
    self.db.drop_table_if_exists(CHUNKS_TABLE).await?;
    self.query_cache.clear();
    self.indexer.checkpoints().delete();
    Ok(())
  }

  /// Refresh an existing index before searching when the filesystem moved on.
  /// Best-effort: failures degrade to searching the stale index.
  async fn auto_reindex_if_stale(&self) {
    if !self.config.search.auto_reindex {
      return;
    }
    if !self.db.has_chunk_table().await.unwrap_or(false) {
      return;
    }

    match self.check_if_stale().await {
      Ok(report) if report.stale => {
        debug!(reason = ?report.reason, "Index stale, refreshing before search");
        if let Err(e) = self.indexer.index_codebase(&IndexOptions::default(), None).await {
          warn!(err = %e, "Auto-reindex failed, searching the stale index");
        }
      }
      Ok(_) => {}
      Err(e) => {
        warn!(err = %e, "Staleness check failed, searching as-is");
      }
    }
  }
}
