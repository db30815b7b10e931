//! Code-similarity search: find chunks resembling a snippet or a file range.

use std::{path::Path, sync::Arc};

use codectx_core::Chunk;
use db::IndexDb;
use embedding::EmbeddingBackend;
use tracing::debug;

use crate::search::SearchError;

const MAX_FETCH_LIMIT: usize = 50;
const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SimilarParams {
  /// Raw code snippet to match against
  pub code: Option<String>,
  /// Alternatively, a file range to read the snippet from
  pub filepath: Option<String>,
  pub start_line: Option<u32>,
  pub end_line: Option<u32>,
  pub limit: Option<usize>,
  /// Drop results with similarity below this bound
  pub threshold: Option<f32>,
  /// Drop candidates whose content equals the probe exactly
  pub exclude_self: bool,
}

#[derive(Debug, Clone)]
pub struct SimilarHit {
  pub chunk: Chunk,
  /// Cosine similarity mapped into [0, 1]
  pub similarity: f32,
}

/// Resolve the probe text and return the nearest chunks with similarity
/// scores.
pub async fn search_similar(
  db: &IndexDb,
  backend: &Arc<dyn EmbeddingBackend>,
  project_root: &Path,
  params: &SimilarParams,
) -> Result<Vec<SimilarHit>, SearchError> {
  if !db.has_chunk_table().await? {
    return Err(SearchError::NotIndexed);
  }

  let probe = resolve_probe(project_root, params).await?;
  let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
  let fetch_limit = (limit * 3).min(MAX_FETCH_LIMIT).max(limit + 1);

  let vector = backend.embed(&probe).await?;
  let candidates = db.search_chunks(&vector, fetch_limit).await?;
  debug!(candidates = candidates.len(), "Scoring similarity candidates");

  let threshold = params.threshold.unwrap_or(0.0);
  let hits: Vec<SimilarHit> = candidates
    .into_iter()
    .map(|(chunk, distance)| SimilarHit {
      similarity: (1.0 - distance).clamp(0.0, 1.0),
      chunk,
    })
    .filter(|hit| hit.similarity >= threshold)
    .filter(|hit| !(params.exclude_self && hit.chunk.content == probe))
    .take(limit)
    .collect();

  Ok(hits)
}

async fn resolve_probe(project_root: &Path, params: &SimilarParams) -> Result<String, SearchError> {
  if let Some(code) = &params.code {
    if code.trim().is_empty() {
      return Err(SearchError::Validation("code snippet is empty".to_string()));
    }
    return Ok(code.clone());
  }

  let (Some(filepath), Some(start_line), Some(end_line)) = (&params.filepath, params.start_line, params.end_line)
  else {
    return Err(SearchError::Validation(
      "either code or (filepath, start_line, end_line) is required".to_string(),
    ));
  };

  if start_line == 0 || start_line > end_line {
    return Err(SearchError::Validation(format!(
      "invalid line range {}-{}",
      start_line, end_line
    )));
  }

  let absolute = project_root.join(filepath);
  let content = tokio::fs::read_to_string(&absolute)
    .await
    .map_err(|e| SearchError::Validation(format!("cannot read {}: {}", filepath, e)))?;

  let lines: Vec<&str> = content.lines().collect();
  let start = (start_line as usize - 1).min(lines.len());
  let end = (end_line as usize).min(lines.len());
  if start >= end {
    return Err(SearchError::Validation(format!(
      "line range {}-{} is outside {} ({} lines)",
      start_line,
      end_line,
      filepath,
      lines.len()
    )));
  }

  Ok(lines[start..end].join("\n"))
}
