mod ollama;
mod openai;
mod retry;

#[cfg(test)]
mod test_server;

use std::sync::Arc;

use codectx_core::{EmbeddingBackendKind, EmbeddingConfig};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use retry::{FetchError, RetryPolicy, fetch_with_retry};

/// Uniform contract over embedding backends.
///
/// `dimensions` is fixed per instance; `batch_size` is an upper bound on the
/// number of texts sent per request. `embed_batch` preserves input order and
/// fails as a whole on any permanent sub-batch failure.
#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
  fn name(&self) -> &str;
  fn model(&self) -> &str;
  fn dimensions(&self) -> usize;
  fn batch_size(&self) -> usize;

  /// Probe reachability and verify the configured model is available.
  async fn initialize(&self) -> Result<(), EmbeddingError>;

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

  /// Convenience over `embed_batch` for a single text.
  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut vectors = self.embed_batch(&[text]).await?;
    vectors
      .pop()
      .ok_or_else(|| EmbeddingError::Failed("backend returned no embedding for single text".to_string()))
  }
}

impl dyn EmbeddingBackend {
  /// Instantiate the configured backend variant.
  pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>, EmbeddingError> {
    match config.backend {
      EmbeddingBackendKind::Ollama => Ok(Arc::new(OllamaBackend::new(config))),
      EmbeddingBackendKind::OpenAi => Ok(Arc::new(OpenAiBackend::new(config)?)),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("embedding backend unreachable: {0}")]
  Unreachable(String),
  #[error("embedding backend rejected credentials: {0}")]
  Auth(String),
  #[error("model not found: {0}")]
  ModelNotFound(String),
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("embedding failed: {0}")]
  Failed(String),
  #[error("network error: {0}")]
  Network(String),
}

impl From<FetchError> for EmbeddingError {
  fn from(e: FetchError) -> Self {
    match e {
      FetchError::NotRewindable => EmbeddingError::Failed(e.to_string()),
      FetchError::Transport(e) => {
        if e.is_connect() || e.is_timeout() {
          EmbeddingError::Unreachable(e.to_string())
        } else {
          EmbeddingError::Request(e)
        }
      }
    }
  }
}

/// Output dimensions of well-known embedding models.
///
/// Unknown models fall back to a backend-defined default.
pub fn known_model_dimensions(model: &str) -> Option<usize> {
  // Ollama tags may carry a ":latest"-style suffix
  let base = model.split(':').next().unwrap_or(model);
  match base {
    "text-embedding-3-small" => Some(1536),
    "text-embedding-3-large" => Some(3072),
    "text-embedding-ada-002" => Some(1536),
    "nomic-embed-text" => Some(768),
    "mxbai-embed-large" => Some(1024),
    "all-minilm" => Some(384),
    "snowflake-arctic-embed" => Some(1024),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn test_known_model_dimensions() {
    assert_eq!(known_model_dimensions("text-embedding-3-small"), Some(1536));
    assert_eq!(known_model_dimensions("text-embedding-3-large"), Some(3072));
    assert_eq!(known_model_dimensions("nomic-embed-text"), Some(768));
    assert_eq!(known_model_dimensions("nomic-embed-text:latest"), Some(768));
    assert_eq!(known_model_dimensions("all-minilm"), Some(384));
    assert_eq!(known_model_dimensions("some-unknown-model"), None);
  }

  #[test]
  fn test_factory_selects_backend() {
    let config = EmbeddingConfig::default();
    let backend = <dyn EmbeddingBackend>::from_config(&config).unwrap();
    assert_eq!(backend.name(), "ollama");

    let config = EmbeddingConfig {
      backend: EmbeddingBackendKind::OpenAi,
      model: "text-embedding-3-small".to_string(),
      api_key: Some("sk-test".to_string()),
      ..Default::default()
    };
    let backend = <dyn EmbeddingBackend>::from_config(&config).unwrap();
    assert_eq!(backend.name(), "openai");
    assert_eq!(backend.dimensions(), 1536);
  }
}
