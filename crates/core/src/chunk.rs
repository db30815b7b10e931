use serde::{Deserialize, Serialize};

/// A contiguous region of a source file — the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
  /// `"{relpath}:{start}-{end}[:{symbol}]"`, unique within an index.
  pub id: String,
  /// POSIX-style path relative to the project root.
  pub filepath: String,
  /// UTF-8 source text, never empty after trim.
  pub content: String,
  /// 1-indexed, inclusive. `start_line <= end_line`.
  pub start_line: u32,
  pub end_line: u32,
  /// Canonical lowercase language token (see [`canonical_language`]).
  pub language: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub symbol_kind: Option<SymbolKind>,
  /// Qualified as `"Class.method"` for nested symbols.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub symbol_name: Option<String>,
}

impl Chunk {
  pub fn new(
    filepath: impl Into<String>,
    content: impl Into<String>,
    start_line: u32,
    end_line: u32,
    language: impl Into<String>,
  ) -> Self {
    let filepath = filepath.into();
    let id = Self::id_for(&filepath, start_line, end_line, None);
    Self {
      id,
      filepath,
      content: content.into(),
      start_line,
      end_line,
      language: language.into(),
      symbol_kind: None,
      symbol_name: None,
    }
  }

  /// Attach a symbol tag and regenerate the id to include the symbol name.
  pub fn with_symbol(mut self, kind: SymbolKind, name: impl Into<String>) -> Self {
    let name = name.into();
    self.id = Self::id_for(&self.filepath, self.start_line, self.end_line, Some(&name));
    self.symbol_kind = Some(kind);
    self.symbol_name = Some(name);
    self
  }

  pub fn id_for(filepath: &str, start_line: u32, end_line: u32, symbol_name: Option<&str>) -> String {
    match symbol_name {
      Some(name) => format!("{}:{}-{}:{}", filepath, start_line, end_line, name),
      None => format!("{}:{}-{}", filepath, start_line, end_line),
    }
  }

  pub fn line_count(&self) -> u32 {
    self.end_line - self.start_line + 1
  }
}

/// A chunk paired with its embedding vector. All vectors in one index share
/// the same dimensionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
  pub chunk: Chunk,
  pub embedding: Vec<f32>,
}

/// The kind of code unit a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
  Function,
  Method,
  Class,
  Interface,
  Type,
  Variable,
  Import,
  Other,
}

impl SymbolKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      SymbolKind::Function => "function",
      SymbolKind::Method => "method",
      SymbolKind::Class => "class",
      SymbolKind::Interface => "interface",
      SymbolKind::Type => "type",
      SymbolKind::Variable => "variable",
      SymbolKind::Import => "import",
      SymbolKind::Other => "other",
    }
  }
}

impl std::str::FromStr for SymbolKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "function" => Ok(SymbolKind::Function),
      "method" => Ok(SymbolKind::Method),
      "class" => Ok(SymbolKind::Class),
      "interface" => Ok(SymbolKind::Interface),
      "type" => Ok(SymbolKind::Type),
      "variable" => Ok(SymbolKind::Variable),
      "import" => Ok(SymbolKind::Import),
      "other" => Ok(SymbolKind::Other),
      _ => Err(format!("unknown symbol kind: {}", s)),
    }
  }
}

impl std::fmt::Display for SymbolKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Map a file extension to its canonical lowercase language token.
///
/// Unknown extensions pass through unchanged so every indexed file carries
/// some language tag.
pub fn canonical_language(ext: &str) -> String {
  match ext {
    "ts" | "tsx" => "typescript",
    "js" | "jsx" => "javascript",
    "py" => "python",
    "go" => "go",
    "rs" => "rust",
    "java" => "java",
    "rb" => "ruby",
    "php" => "php",
    "c" | "h" => "c",
    "cpp" | "hpp" => "cpp",
    "cs" => "csharp",
    "swift" => "swift",
    "kt" => "kotlin",
    "md" => "markdown",
    "json" => "json",
    "yml" | "yaml" => "yaml",
    other => return other.to_string(),
  }
  .to_string()
}

/// Whether the extension maps to a language with an AST chunking strategy.
pub fn ast_supported(ext: &str) -> bool {
  matches!(
    ext,
    "rs" | "py" | "go" | "java" | "rb" | "ts" | "tsx" | "js" | "jsx"
  )
}
