//! Hybrid ranked search over the persisted chunk table.

use std::sync::Arc;

use codectx_core::{Chunk, canonical_language};
use db::{DbError, IndexDb};
use embedding::{EmbeddingBackend, EmbeddingError};
use globset::Glob;
use tracing::debug;

use crate::{
  cache::QueryCache,
  ranker::{RankingWeights, rank},
};

/// Cap on candidates pulled from the vector store per query.
const MAX_FETCH_LIMIT: usize = 50;
const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SearchParams {
  pub query: String,
  pub limit: Option<usize>,
  /// Glob over relative filepaths; a leading `!` inverts the match
  pub path_pattern: Option<String>,
  /// Keep only candidates whose canonical language matches any entry
  pub languages: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
  #[error("no index exists; run indexing first")]
  NotIndexed,
  #[error("validation error: {0}")]
  Validation(String),
  #[error("store error: {0}")]
  Db(#[from] DbError),
  #[error("embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
}

/// Execute a hybrid search: vector retrieval, score fusion, post-filters.
pub async fn search(
  db: &IndexDb,
  backend: &Arc<dyn EmbeddingBackend>,
  cache: &QueryCache,
  weights: RankingWeights,
  params: &SearchParams,
) -> Result<Vec<Chunk>, SearchError> {
  if !db.has_chunk_table().await? {
    return Err(SearchError::NotIndexed);
  }

  let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
  let fetch_limit = (limit * 3).min(MAX_FETCH_LIMIT);

  let query_vector = match cache.get(&params.query) {
    Some(vector) => vector,
    None => {
      let vector = backend.embed(&params.query).await?;
      cache.insert(&params.query, vector.clone());
      Arc::new(vector)
    }
  };

  let candidates = db.search_chunks(&query_vector, fetch_limit).await?;
  debug!(query = %params.query, candidates = candidates.len(), fetch_limit, "Ranking candidates");

  let ranked = rank(candidates, &params.query, fetch_limit, weights);

  let path_filter = params
    .path_pattern
    .as_deref()
    .map(PathFilter::parse)
    .transpose()?;
  let languages: Option<Vec<String>> = params
    .languages
    .as_ref()
    .map(|langs| langs.iter().map(|l| l.to_lowercase()).collect());

  let results: Vec<Chunk> = ranked
    .into_iter()
    .filter(|hit| path_filter.as_ref().is_none_or(|f| f.matches(&hit.chunk.filepath)))
    .filter(|hit| matches_language(languages.as_deref(), &hit.chunk.language))
    .take(limit)
    .map(|hit| hit.chunk)
    .collect();

  Ok(results)
}

fn matches_language(languages: Option<&[String]>, chunk_language: &str) -> bool {
  let Some(languages) = languages else {
    return true;
  };
  languages
    .iter()
    .any(|entry| entry == chunk_language || canonical_language(entry) == chunk_language)
}

/// Path glob with optional leading-`!` negation.
struct PathFilter {
  matcher: globset::GlobMatcher,
  negated: bool,
}

impl PathFilter {
  fn parse(pattern: &str) -> Result<Self, SearchError> {
    let (negated, raw) = match pattern.strip_prefix('!') {
      Some(rest) => (true, rest),
      None => (false, pattern),
    };
    let glob =
      Glob::new(raw).map_err(|e| SearchError::Validation(format!("invalid path pattern '{}': {}", pattern, e)))?;
    Ok(Self {
      matcher: glob.compile_matcher(),
      negated,
    })
  }

  fn matches(&self, filepath: &str) -> bool {
    self.matcher.is_match(filepath) != self.negated
  }
}
