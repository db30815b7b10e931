//! TTL + LRU cache for query embeddings.
//!
//! Process-wide, keyed by query string. Cleared whenever the index is
//! cleared so a rebuilt index never serves vectors from the old model.

use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use tracing::trace;

const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

pub struct QueryCache {
  cache: Cache<String, Arc<Vec<f32>>>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryCache {
  pub fn new() -> Self {
    Self::with_settings(DEFAULT_CAPACITY, DEFAULT_TTL)
  }

  pub fn with_settings(capacity: u64, ttl: Duration) -> Self {
    Self {
      cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
    }
  }

  /// Cached vector for a query; expired entries miss.
  pub fn get(&self, query: &str) -> Option<Arc<Vec<f32>>> {
    let hit = self.cache.get(query);
    trace!(hit = hit.is_some(), "Query cache lookup");
    hit
  }

  pub fn insert(&self, query: &str, vector: Vec<f32>) {
    self.cache.insert(query.to_string(), Arc::new(vector));
  }

  /// Drop every entry (called on clear_index).
  pub fn clear(&self) {
    self.cache.invalidate_all();
  }

  pub fn entry_count(&self) -> u64 {
    // moka maintenance is deferred; run it so counts are accurate
    self.cache.run_pending_tasks();
    self.cache.entry_count()
  }
}
