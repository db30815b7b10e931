//! Shared fixtures for engine integration tests.

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use codectx::{Config, EmbeddingBackend, EmbeddingError, IndexEngine};
use tempfile::TempDir;

/// Deterministic bag-of-bytes embedding: texts sharing characters land near
/// each other, distinct texts stay distinct. No network involved.
pub fn stub_vector(text: &str, dims: usize) -> Vec<f32> {
  let mut v = vec![0.0f32; dims];
  for &b in text.as_bytes() {
    v[b as usize % dims] += 1.0;
  }
  let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
  if norm > 0.0 {
    for x in &mut v {
      *x /= norm;
    }
  }
  v
}

pub struct StubBackend {
  pub dims: usize,
  pub batch_calls: AtomicUsize,
}

impl StubBackend {
  pub fn new(dims: usize) -> Arc<Self> {
    Arc::new(Self {
      dims,
      batch_calls: AtomicUsize::new(0),
    })
  }

  pub fn calls(&self) -> usize {
    self.batch_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl EmbeddingBackend for StubBackend {
  fn name(&self) -> &str {
    "stub"
  }
  fn model(&self) -> &str {
    "stub-model"
  }
  fn dimensions(&self) -> usize {
    self.dims
  }
  fn batch_size(&self) -> usize {
    16
  }

  async fn initialize(&self) -> Result<(), EmbeddingError> {
    Ok(())
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.batch_calls.fetch_add(1, Ordering::SeqCst);
    Ok(texts.iter().map(|t| stub_vector(t, self.dims)).collect())
  }
}

pub struct EngineFixture {
  pub project: TempDir,
  pub backend: Arc<StubBackend>,
  pub engine: IndexEngine,
}

pub async fn engine_fixture() -> EngineFixture {
  engine_fixture_with(8, Config::default()).await
}

pub async fn engine_fixture_with(dims: usize, config: Config) -> EngineFixture {
  let project = TempDir::new().unwrap();
  let backend = StubBackend::new(dims);
  let engine = IndexEngine::with_backend(project.path(), Arc::new(config), backend.clone())
    .await
    .unwrap();
  EngineFixture {
    project,
    backend,
    engine,
  }
}

/// Bump a file's mtime well past its current value so change detection fires.
pub fn bump_mtime(path: &std::path::Path) {
  let metadata = std::fs::metadata(path).unwrap();
  let current = filetime::FileTime::from_last_modification_time(&metadata);
  let bumped = filetime::FileTime::from_unix_time(current.unix_seconds() + 10, 0);
  filetime::set_file_mtime(path, bumped).unwrap();
}
