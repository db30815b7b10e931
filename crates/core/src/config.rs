//! Configuration resolution with per-section lenient validation.
//!
//! The resolver merges a user-supplied TOML file with defaults. Each section
//! is validated independently: invalid sub-fields are dropped with a warning
//! while the rest of the section still applies. A file that fails to parse at
//! all yields a fully-default configuration and a single warning.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Config file name, resolved relative to the project root.
pub const CONFIG_FILE: &str = ".codectx.toml";

/// Which embedding backend to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
  #[default]
  Ollama,
  OpenAi,
}

impl EmbeddingBackendKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EmbeddingBackendKind::Ollama => "ollama",
      EmbeddingBackendKind::OpenAi => "openai",
    }
  }
}

impl std::str::FromStr for EmbeddingBackendKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "ollama" => Ok(EmbeddingBackendKind::Ollama),
      "openai" => Ok(EmbeddingBackendKind::OpenAi),
      _ => Err(format!("unknown embedding backend: {}", s)),
    }
  }
}

/// Embedding backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  pub backend: EmbeddingBackendKind,

  /// Model name (e.g. "nomic-embed-text", "text-embedding-3-small")
  pub model: String,

  /// Maximum concurrent embedding requests (1-200)
  pub concurrency: usize,

  /// Ollama server URL (only used when backend = ollama)
  pub ollama_url: String,

  /// API key for the remote backend. Falls back to OPENAI_API_KEY env var.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      backend: EmbeddingBackendKind::Ollama,
      model: "nomic-embed-text".to_string(),
      concurrency: 1,
      ollama_url: "http://localhost:11434".to_string(),
      api_key: None,
    }
  }
}

/// Structural chunker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
  /// Maximum lines per chunk (10-500)
  pub max_lines: usize,

  /// Overlap between line-strategy windows (0-50)
  pub overlap: usize,
}

impl Default for ChunkingConfig {
  fn default() -> Self {
    Self {
      max_lines: 100,
      overlap: 20,
    }
  }
}

/// Hybrid search weights and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
  /// Weight of the vector-rank score (0-1)
  pub semantic_weight: f32,

  /// Weight of the lexical keyword score (0-1)
  pub keyword_weight: f32,

  /// Re-index automatically when staleness is detected before a search
  pub auto_reindex: bool,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      semantic_weight: 0.7,
      keyword_weight: 0.3,
      auto_reindex: true,
    }
  }
}

/// Indexing orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
  /// Chunks per embedding batch (1-1000)
  pub batch_size: usize,

  /// Pause between embedding batches in milliseconds (0-10000)
  pub batch_delay_ms: u64,
}

impl Default for IndexingConfig {
  fn default() -> Self {
    Self {
      batch_size: 200,
      batch_delay_ms: 0,
    }
  }
}

/// The fully-resolved, immutable engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Include globs for file enumeration
  pub patterns: Vec<String>,

  /// Exclude globs for file enumeration
  pub exclude_patterns: Vec<String>,

  pub embedding: EmbeddingConfig,
  pub chunking: ChunkingConfig,
  pub search: SearchConfig,
  pub indexing: IndexingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      patterns: default_patterns(),
      exclude_patterns: default_exclude_patterns(),
      embedding: EmbeddingConfig::default(),
      chunking: ChunkingConfig::default(),
      search: SearchConfig::default(),
      indexing: IndexingConfig::default(),
    }
  }
}

fn default_patterns() -> Vec<String> {
  [
    "**/*.ts", "**/*.tsx", "**/*.js", "**/*.jsx", "**/*.py", "**/*.go", "**/*.rs", "**/*.java", "**/*.rb",
    "**/*.php", "**/*.c", "**/*.h", "**/*.cpp", "**/*.hpp", "**/*.cs", "**/*.swift", "**/*.kt", "**/*.md",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_exclude_patterns() -> Vec<String> {
  [
    "**/node_modules/**",
    "**/target/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/vendor/**",
    "**/.index/**",
    "**/__pycache__/**",
    "**/.venv/**",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

/// A configuration field that was dropped during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
  /// Dotted path of the offending field (e.g. "chunking.max_lines")
  pub field: String,
  pub message: String,
}

impl std::fmt::Display for ConfigWarning {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.field, self.message)
  }
}

impl Config {
  /// Load the config for a project root, logging any dropped fields.
  pub fn load_for_project(project_root: &Path) -> Self {
    let path = project_root.join(CONFIG_FILE);
    if !path.exists() {
      return Self::default();
    }

    let content = match std::fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) => {
        warn!(path = %path.display(), err = %e, "Failed to read config file, using defaults");
        return Self::default();
      }
    };

    let (config, warnings) = Self::from_toml_str(&content);
    for warning in &warnings {
      warn!(field = %warning.field, "Dropped config field: {}", warning.message);
    }
    config
  }

  /// Resolve a config from TOML source, returning the dropped-field warnings.
  ///
  /// Sections are validated independently so a bad value in one section never
  /// discards the rest of the file.
  pub fn from_toml_str(content: &str) -> (Self, Vec<ConfigWarning>) {
    let mut warnings = Vec::new();
    let mut config = Self::default();

    let value: toml::Value = match content.parse() {
      Ok(value) => value,
      Err(e) => {
        warnings.push(ConfigWarning {
          field: "<file>".to_string(),
          message: format!("invalid TOML, using defaults: {}", e),
        });
        return (config, warnings);
      }
    };

    let Some(root) = value.as_table() else {
      warnings.push(ConfigWarning {
        field: "<file>".to_string(),
        message: "config root is not a table, using defaults".to_string(),
      });
      return (config, warnings);
    };

    if let Some(patterns) = string_list(root, "patterns", &mut warnings) {
      config.patterns = patterns;
    }
    if let Some(excludes) = string_list(root, "exclude_patterns", &mut warnings) {
      config.exclude_patterns = excludes;
    }

    if let Some(table) = section(root, "embedding", &mut warnings) {
      if let Some(v) = table.get("backend") {
        match v.as_str().map(str::parse::<EmbeddingBackendKind>) {
          Some(Ok(kind)) => config.embedding.backend = kind,
          _ => drop_field(&mut warnings, "embedding.backend", "expected \"ollama\" or \"openai\""),
        }
      }
      if let Some(model) = string_field(table, "embedding", "model", &mut warnings) {
        config.embedding.model = model;
      }
      if let Some(concurrency) = int_in_range(table, "embedding", "concurrency", 1, 200, &mut warnings) {
        config.embedding.concurrency = concurrency as usize;
      }
      if let Some(url) = string_field(table, "embedding", "ollama_url", &mut warnings) {
        config.embedding.ollama_url = url;
      }
      if let Some(key) = string_field(table, "embedding", "api_key", &mut warnings) {
        config.embedding.api_key = Some(key);
      }
    }

    if let Some(table) = section(root, "chunking", &mut warnings) {
      if let Some(max_lines) = int_in_range(table, "chunking", "max_lines", 10, 500, &mut warnings) {
        config.chunking.max_lines = max_lines as usize;
      }
      if let Some(overlap) = int_in_range(table, "chunking", "overlap", 0, 50, &mut warnings) {
        config.chunking.overlap = overlap as usize;
      }
    }

    if let Some(table) = section(root, "search", &mut warnings) {
      if let Some(weight) = float_in_range(table, "search", "semantic_weight", 0.0, 1.0, &mut warnings) {
        config.search.semantic_weight = weight as f32;
      }
      if let Some(weight) = float_in_range(table, "search", "keyword_weight", 0.0, 1.0, &mut warnings) {
        config.search.keyword_weight = weight as f32;
      }
      if let Some(v) = table.get("auto_reindex") {
        match v.as_bool() {
          Some(flag) => config.search.auto_reindex = flag,
          None => drop_field(&mut warnings, "search.auto_reindex", "expected a boolean"),
        }
      }
    }

    if let Some(table) = section(root, "indexing", &mut warnings) {
      if let Some(batch_size) = int_in_range(table, "indexing", "batch_size", 1, 1000, &mut warnings) {
        config.indexing.batch_size = batch_size as usize;
      }
      if let Some(delay) = int_in_range(table, "indexing", "batch_delay_ms", 0, 10000, &mut warnings) {
        config.indexing.batch_delay_ms = delay as u64;
      }
    }

    (config, warnings)
  }
}

fn drop_field(warnings: &mut Vec<ConfigWarning>, field: &str, message: &str) {
  warnings.push(ConfigWarning {
    field: field.to_string(),
    message: message.to_string(),
  });
}

fn section<'a>(
  root: &'a toml::map::Map<String, toml::Value>,
  name: &str,
  warnings: &mut Vec<ConfigWarning>,
) -> Option<&'a toml::map::Map<String, toml::Value>> {
  let value = root.get(name)?;
  match value.as_table() {
    Some(table) => Some(table),
    None => {
      drop_field(warnings, name, "expected a table");
      None
    }
  }
}

fn string_field(
  table: &toml::map::Map<String, toml::Value>,
  section: &str,
  key: &str,
  warnings: &mut Vec<ConfigWarning>,
) -> Option<String> {
  let value = table.get(key)?;
  match value.as_str() {
    Some(s) => Some(s.to_string()),
    None => {
      drop_field(warnings, &format!("{}.{}", section, key), "expected a string");
      None
    }
  }
}

fn string_list(
  table: &toml::map::Map<String, toml::Value>,
  key: &str,
  warnings: &mut Vec<ConfigWarning>,
) -> Option<Vec<String>> {
  let value = table.get(key)?;
  let Some(array) = value.as_array() else {
    drop_field(warnings, key, "expected an array of strings");
    return None;
  };

  let mut items = Vec::with_capacity(array.len());
  for item in array {
    match item.as_str() {
      Some(s) => items.push(s.to_string()),
      None => {
        drop_field(warnings, key, "expected an array of strings");
        return None;
      }
    }
  }
  Some(items)
}

fn int_in_range(
  table: &toml::map::Map<String, toml::Value>,
  section: &str,
  key: &str,
  min: i64,
  max: i64,
  warnings: &mut Vec<ConfigWarning>,
) -> Option<i64> {
  let value = table.get(key)?;
  let field = format!("{}.{}", section, key);
  match value.as_integer() {
    Some(n) if (min..=max).contains(&n) => Some(n),
    Some(n) => {
      drop_field(warnings, &field, &format!("{} outside range {}-{}", n, min, max));
      None
    }
    None => {
      drop_field(warnings, &field, "expected an integer");
      None
    }
  }
}

fn float_in_range(
  table: &toml::map::Map<String, toml::Value>,
  section: &str,
  key: &str,
  min: f64,
  max: f64,
  warnings: &mut Vec<ConfigWarning>,
) -> Option<f64> {
  let value = table.get(key)?;
  let field = format!("{}.{}", section, key);
  let number = value.as_float().or_else(|| value.as_integer().map(|n| n as f64));
  match number {
    Some(n) if (min..=max).contains(&n) => Some(n),
    Some(n) => {
      drop_field(warnings, &field, &format!("{} outside range {}-{}", n, min, max));
      None
    }
    None => {
      drop_field(warnings, &field, "expected a number");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.embedding.backend, EmbeddingBackendKind::Ollama);
    assert_eq!(config.embedding.concurrency, 1);
    assert_eq!(config.chunking.max_lines, 100);
    assert_eq!(config.chunking.overlap, 20);
    assert_eq!(config.search.semantic_weight, 0.7);
    assert_eq!(config.search.keyword_weight, 0.3);
    assert!(config.search.auto_reindex);
    assert_eq!(config.indexing.batch_size, 200);
    assert_eq!(config.indexing.batch_delay_ms, 0);
    assert!(config.patterns.iter().any(|p| p == "**/*.rs"));
    assert!(config.exclude_patterns.iter().any(|p| p == "**/node_modules/**"));
  }

  #[test]
  fn test_valid_overrides_merge() {
    let toml = r#"
patterns = ["src/**/*.rs"]

[embedding]
backend = "openai"
model = "text-embedding-3-small"
concurrency = 4

[chunking]
max_lines = 80
"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert!(warnings.is_empty(), "warnings: {:?}", warnings);
    assert_eq!(config.patterns, vec!["src/**/*.rs".to_string()]);
    assert_eq!(config.embedding.backend, EmbeddingBackendKind::OpenAi);
    assert_eq!(config.embedding.model, "text-embedding-3-small");
    assert_eq!(config.embedding.concurrency, 4);
    assert_eq!(config.chunking.max_lines, 80);
    // Untouched sections keep defaults
    assert_eq!(config.chunking.overlap, 20);
    assert_eq!(config.indexing.batch_size, 200);
  }

  #[test]
  fn test_out_of_range_field_dropped() {
    let toml = r#"
[chunking]
max_lines = 5000
overlap = 10
"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert_eq!(config.chunking.max_lines, 100, "invalid value falls back to default");
    assert_eq!(config.chunking.overlap, 10, "valid sibling still applies");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].field, "chunking.max_lines");
  }

  #[test]
  fn test_wrong_type_dropped() {
    let toml = r#"
[search]
semantic_weight = "heavy"
keyword_weight = 0.5
"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert_eq!(config.search.semantic_weight, 0.7);
    assert_eq!(config.search.keyword_weight, 0.5);
    assert_eq!(warnings.len(), 1);
  }

  #[test]
  fn test_unknown_backend_dropped() {
    let toml = r#"
[embedding]
backend = "acme"
model = "custom"
"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert_eq!(config.embedding.backend, EmbeddingBackendKind::Ollama);
    assert_eq!(config.embedding.model, "custom");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].field, "embedding.backend");
  }

  #[test]
  fn test_invalid_toml_yields_defaults() {
    let (config, warnings) = Config::from_toml_str("this is [not toml");
    assert_eq!(config.chunking.max_lines, 100);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].field, "<file>");
  }

  #[test]
  fn test_integer_accepted_for_float_field() {
    let toml = r#"
[search]
semantic_weight = 1
"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert!(warnings.is_empty());
    assert_eq!(config.search.semantic_weight, 1.0);
  }

  #[test]
  fn test_mixed_pattern_array_dropped() {
    let toml = r#"patterns = ["src/**", 42]"#;
    let (config, warnings) = Config::from_toml_str(toml);
    assert!(config.patterns.iter().any(|p| p == "**/*.rs"), "defaults kept");
    assert_eq!(warnings.len(), 1);
  }

  #[test]
  fn test_load_for_project_missing_file() {
    let temp = TempDir::new().unwrap();
    let config = Config::load_for_project(temp.path());
    assert_eq!(config.chunking.max_lines, 100);
  }

  #[test]
  fn test_load_for_project_reads_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join(CONFIG_FILE), "[indexing]\nbatch_size = 50\n").unwrap();
    let config = Config::load_for_project(temp.path());
    assert_eq!(config.indexing.batch_size, 50);
  }

  #[test]
  fn test_toml_roundtrip() {
    let config = Config {
      embedding: EmbeddingConfig {
        backend: EmbeddingBackendKind::OpenAi,
        model: "text-embedding-3-large".to_string(),
        ..Default::default()
      },
      ..Default::default()
    };

    let serialized = toml::to_string_pretty(&config).unwrap();
    let (parsed, warnings) = Config::from_toml_str(&serialized);
    assert!(warnings.is_empty(), "warnings: {:?}", warnings);
    assert_eq!(parsed.embedding.backend, EmbeddingBackendKind::OpenAi);
    assert_eq!(parsed.embedding.model, "text-embedding-3-large");
  }
}
