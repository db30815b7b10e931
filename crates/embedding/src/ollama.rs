use async_trait::async_trait;
use codectx_core::EmbeddingConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{EmbeddingBackend, EmbeddingError, RetryPolicy, fetch_with_retry, known_model_dimensions};

/// Fallback output dimensions for models we don't recognize.
const OLLAMA_DEFAULT_DIMENSIONS: usize = 768;

/// Upper bound on texts per /api/embed request.
const OLLAMA_BATCH_SIZE: usize = 32;

/// Local-HTTP embedding backend speaking the Ollama API.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
  client: reqwest::Client,
  base_url: String,
  model: String,
  dimensions: usize,
  batch_size: usize,
  /// Maximum concurrent sub-batch requests (1 = strictly sequential)
  max_concurrent: usize,
  retry: RetryPolicy,
}

impl OllamaBackend {
  pub fn new(config: &EmbeddingConfig) -> Self {
    let dimensions = known_model_dimensions(&config.model).unwrap_or(OLLAMA_DEFAULT_DIMENSIONS);

    info!(
      base_url = %config.ollama_url,
      model = %config.model,
      dimensions,
      concurrency = config.concurrency,
      "Ollama backend initialized"
    );

    Self {
      client: reqwest::Client::new(),
      base_url: config.ollama_url.trim_end_matches('/').to_string(),
      model: config.model.clone(),
      dimensions,
      batch_size: OLLAMA_BATCH_SIZE,
      max_concurrent: config.concurrency.max(1),
      retry: RetryPolicy::default(),
    }
  }

  fn tags_url(&self) -> String {
    format!("{}/api/tags", self.base_url)
  }

  fn embed_url(&self) -> String {
    format!("{}/api/embed", self.base_url)
  }

  /// Embed one sub-batch of at most `batch_size` texts.
  #[tracing::instrument(level = "trace", skip(self, texts), fields(batch_size = texts.len()))]
  async fn embed_single_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = BatchEmbedRequest {
      model: &self.model,
      input: texts.to_vec(),
    };

    trace!(batch_size = texts.len(), model = %self.model, "Sending batch embedding request");
    let response = fetch_with_retry(self.client.post(self.embed_url()).json(&request), &self.retry).await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, batch_size = texts.len(), model = %self.model, "Ollama batch embedding failed");
      return Err(EmbeddingError::Failed(format!("ollama returned {}: {}", status, body)));
    }

    let result: BatchEmbedResponse = response.json().await?;

    if result.embeddings.len() != texts.len() {
      return Err(EmbeddingError::Failed(format!(
        "batch size mismatch: got {} embeddings for {} inputs",
        result.embeddings.len(),
        texts.len()
      )));
    }

    for (i, embedding) in result.embeddings.iter().enumerate() {
      if embedding.len() != self.dimensions {
        warn!(
          index = i,
          expected = self.dimensions,
          got = embedding.len(),
          model = %self.model,
          "Unexpected embedding dimensions"
        );
      }
    }

    Ok(result.embeddings)
  }
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
  embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
  #[serde(default)]
  models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
  name: String,
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
  fn name(&self) -> &str {
    "ollama"
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
    let response = fetch_with_retry(self.client.get(self.tags_url()), &self.retry)
      .await
      .map_err(|e| EmbeddingError::Unreachable(e.to_string()))?;

    if !response.status().is_success() {
      return Err(EmbeddingError::Unreachable(format!(
        "ollama list-models probe returned {}",
        response.status()
      )));
    }

    let tags: TagsResponse = response.json().await?;
    // Tags carry a ":latest"-style suffix; match on the bare name too
    let available = tags
      .models
      .iter()
      .any(|m| m.name == self.model || m.name.split(':').next() == Some(self.model.as_str()));

    if !available {
      return Err(EmbeddingError::ModelNotFound(format!(
        "model '{}' is not available on {} (try `ollama pull {}`)",
        self.model, self.base_url, self.model
      )));
    }

    debug!(model = %self.model, "Ollama model verified");
    Ok(())
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      trace!("Empty batch, returning immediately");
      return Ok(Vec::new());
    }

    let num_batches = texts.len().div_ceil(self.batch_size);
    debug!(batch_size = texts.len(), sub_batches = num_batches, model = %self.model, "Embedding batch");

    if self.max_concurrent <= 1 || num_batches <= 1 {
      let mut all = Vec::with_capacity(texts.len());
      for chunk in texts.chunks(self.batch_size) {
        all.extend(self.embed_single_batch(chunk).await?);
      }
      return Ok(all);
    }

    // Bounded concurrency; results re-ordered by sub-batch index
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
    let futures: Vec<_> = texts
      .chunks(self.batch_size)
      .enumerate()
      .map(|(batch_idx, chunk)| {
        let permit = semaphore.clone();
        let backend = self.clone();
        let chunk_owned: Vec<String> = chunk.iter().map(|s| s.to_string()).collect();
        async move {
          let _permit = permit
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Failed("semaphore closed".to_string()))?;
          let chunk_refs: Vec<&str> = chunk_owned.iter().map(|s| s.as_str()).collect();
          let embeddings = backend.embed_single_batch(&chunk_refs).await?;
          Ok::<_, EmbeddingError>((batch_idx, embeddings))
        }
      })
      .collect();

    let results = futures::future::join_all(futures).await;

    let mut indexed: Vec<(usize, Vec<Vec<f32>>)> = Vec::with_capacity(num_batches);
    for result in results {
      indexed.push(result?);
    }
    indexed.sort_by_key(|(idx, _)| *idx);

    let mut all = Vec::with_capacity(texts.len());
    for (_, embeddings) in indexed {
      all.extend(embeddings);
    }
    Ok(all)
  }
}
