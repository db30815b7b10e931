use async_trait::async_trait;
use codectx_core::EmbeddingConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{EmbeddingBackend, EmbeddingError, RetryPolicy, fetch_with_retry, known_model_dimensions};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Fallback output dimensions for models we don't recognize.
const OPENAI_DEFAULT_DIMENSIONS: usize = 1536;

/// Upper bound on texts per /v1/embeddings request.
const OPENAI_BATCH_SIZE: usize = 100;

/// Remote-API embedding backend with bearer credentials.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
  client: reqwest::Client,
  base_url: String,
  api_key: String,
  model: String,
  dimensions: usize,
  batch_size: usize,
  retry: RetryPolicy,
}

impl OpenAiBackend {
  pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
    let api_key = match config.api_key.clone().or_else(Self::key_from_env) {
      Some(key) => key,
      None => {
        return Err(EmbeddingError::Auth(
          "no API key configured (set embedding.api_key or OPENAI_API_KEY)".to_string(),
        ));
      }
    };

    let dimensions = known_model_dimensions(&config.model).unwrap_or(OPENAI_DEFAULT_DIMENSIONS);

    info!(model = %config.model, dimensions, "OpenAI backend initialized");

    Ok(Self {
      client: reqwest::Client::new(),
      base_url: OPENAI_BASE_URL.to_string(),
      api_key,
      model: config.model.clone(),
      dimensions,
      batch_size: OPENAI_BATCH_SIZE,
      retry: RetryPolicy::default(),
    })
  }

  fn key_from_env() -> Option<String> {
    match std::env::var("OPENAI_API_KEY") {
      Ok(key) if !key.is_empty() => {
        debug!("OPENAI_API_KEY found in environment");
        Some(key)
      }
      _ => None,
    }
  }

  fn models_url(&self) -> String {
    format!("{}/v1/models", self.base_url)
  }

  fn embeddings_url(&self) -> String {
    format!("{}/v1/embeddings", self.base_url)
  }

  #[tracing::instrument(level = "trace", skip(self, texts), fields(batch_size = texts.len()))]
  async fn embed_single_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = EmbeddingsRequest {
      model: &self.model,
      input: texts.to_vec(),
    };

    trace!(batch_size = texts.len(), model = %self.model, "Sending batch embedding request");
    let response = fetch_with_retry(
      self
        .client
        .post(self.embeddings_url())
        .bearer_auth(&self.api_key)
        .json(&request),
      &self.retry,
    )
    .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(EmbeddingError::Auth(format!("embeddings request returned {}", status)));
      }
      warn!(status = %status, batch_size = texts.len(), model = %self.model, "OpenAI batch embedding failed");
      return Err(EmbeddingError::Failed(format!("openai returned {}: {}", status, body)));
    }

    let result: EmbeddingsResponse = response.json().await?;

    if result.data.len() != texts.len() {
      return Err(EmbeddingError::Failed(format!(
        "batch size mismatch: got {} embeddings for {} inputs",
        result.data.len(),
        texts.len()
      )));
    }

    // The API tags each embedding with its input index; re-order defensively
    let mut data = result.data;
    data.sort_by_key(|d| d.index);

    Ok(data.into_iter().map(|d| d.embedding).collect())
  }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
  data: Vec<EmbeddingObject>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingObject {
  index: usize,
  embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
  #[serde(default)]
  data: Vec<ModelObject>,
}

#[derive(Debug, Deserialize)]
struct ModelObject {
  id: String,
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
  fn name(&self) -> &str {
    "openai"
  }

  fn model(&self) -> &str {
    &self.model
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  fn batch_size(&self) -> usize {
    self.batch_size
  }

  async fn initialize(&self) -> Result<(), EmbeddingError> {
    let response = fetch_with_retry(self.client.get(self.models_url()).bearer_auth(&self.api_key), &self.retry)
      .await
      .map_err(|e| EmbeddingError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
      return Err(EmbeddingError::Auth(format!("list-models probe returned {}", status)));
    }
    if !status.is_success() {
      return Err(EmbeddingError::Unreachable(format!(
        "list-models probe returned {}",
        status
      )));
    }

    let models: ModelsResponse = response.json().await?;
    if !models.data.iter().any(|m| m.id == self.model) {
      return Err(EmbeddingError::ModelNotFound(format!(
        "model '{}' is not available for these credentials",
        self.model
      )));
    }

    debug!(model = %self.model, "OpenAI model verified");
    Ok(())
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      trace!("Empty batch, returning immediately");
      return Ok(Vec::new());
    }

    debug!(
      batch_size = texts.len(),
      sub_batches = texts.len().div_ceil(self.batch_size),
      model = %self.model,
      "Embedding batch"
    );

    let mut all = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(self.batch_size) {
      all.extend(self.embed_single_batch(chunk).await?);
    }
    Ok(all)
  }
}
