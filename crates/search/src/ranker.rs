//! Hybrid score fusion: normalized vector rank blended with lexical
//! keyword/path scoring.

use codectx_core::Chunk;
use regex::Regex;

#[derive(Debug, Clone, Copy)]
pub struct RankingWeights {
  pub semantic: f32,
  pub keyword: f32,
}

impl Default for RankingWeights {
  fn default() -> Self {
    Self {
      semantic: 0.7,
      keyword: 0.3,
    }
  }
}

/// A candidate with its fused score. `vector_rank` is the original
/// vector-store position, kept for stable tie-breaks.
#[derive(Debug, Clone)]
pub struct RankedHit {
  pub chunk: Chunk,
  pub score: f32,
  pub vector_rank: usize,
}

/// Lowercased query tokens, dropping anything of length <= 2.
fn tokenize(query: &str) -> Vec<String> {
  query
    .split_whitespace()
    .map(str::to_lowercase)
    .filter(|t| t.len() > 2)
    .collect()
}

/// Per-token word-boundary matchers, compiled once per query.
fn word_matchers(tokens: &[String]) -> Vec<Option<Regex>> {
  tokens
    .iter()
    .map(|t| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(t))).ok())
    .collect()
}

/// Keyword score in [0, 1] per the lexical scheme:
/// +1.0 substring in content, +0.5 whole-word bonus, +0.5 filepath hit;
/// `min(matches/n + min(bonus/n, 0.5), 1)`.
pub fn keyword_score(query: &str, content: &str, filepath: &str) -> f32 {
  let tokens = tokenize(query);
  let matchers = word_matchers(&tokens);
  score_with_tokens(&tokens, &matchers, content, filepath)
}

fn score_with_tokens(tokens: &[String], matchers: &[Option<Regex>], content: &str, filepath: &str) -> f32 {
  if tokens.is_empty() {
    return 0.0;
  }

  let content_lower = content.to_lowercase();
  let filepath_lower = filepath.to_lowercase();

  let mut match_count = 0.0f32;
  let mut exact_bonus = 0.0f32;

  for (token, matcher) in tokens.iter().zip(matchers) {
    if content_lower.contains(token.as_str()) {
      match_count += 1.0;
      if matcher.as_ref().is_some_and(|m| m.is_match(content)) {
        exact_bonus += 0.5;
      }
    }
    if filepath_lower.contains(token.as_str()) {
      match_count += 0.5;
    }
  }

  let n = tokens.len() as f32;
  let base = match_count / n;
  let exact = (exact_bonus / n).min(0.5);
  (base + exact).min(1.0)
}

/// Fuse vector rank and keyword score over candidates in vector-store order.
///
/// `fetch_limit` is the requested candidate budget; rank i maps to a
/// semantic score of `1 - i/fetch_limit`. The sort is stable, so ties keep
/// the original vector-store order.
pub fn rank(candidates: Vec<(Chunk, f32)>, query: &str, fetch_limit: usize, weights: RankingWeights) -> Vec<RankedHit> {
  let tokens = tokenize(query);
  let matchers = word_matchers(&tokens);
  let fetch_limit = fetch_limit.max(1) as f32;

  let mut hits: Vec<RankedHit> = candidates
    .into_iter()
    .enumerate()
    .map(|(i, (chunk, _distance))| {
      let semantic = 1.0 - i as f32 / fetch_limit;
      let keyword = score_with_tokens(&tokens, &matchers, &chunk.content, &chunk.filepath);
      RankedHit {
        score: weights.semantic * semantic + weights.keyword * keyword,
        vector_rank: i,
        chunk,
      }
    })
    .collect();

  hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
  hits
}
