//! AST-aware structural chunking with a line-window fallback.
//!
//! Strategy selection is by file extension: supported grammars go through
//! tree-sitter, everything else (and any file that fails to parse) gets the
//! sliding line window. The empty file yields zero chunks.

use std::path::Path;

use codectx_core::{Chunk, ChunkingConfig, SymbolKind, ast_supported, canonical_language};
use tracing::debug;
use tree_sitter::{Node, Parser};

use crate::languages::{self, LanguageSpec};

/// Parts smaller than this merge into the preceding part during splitting.
const MIN_LINES: usize = 3;

pub struct Chunker {
  max_lines: usize,
  overlap: usize,
}

impl Default for Chunker {
  fn default() -> Self {
    Self::new(&ChunkingConfig::default())
  }
}

struct AstContext<'a> {
  spec: &'a LanguageSpec,
  path: &'a str,
  language: &'a str,
  lines: &'a [&'a str],
  source: &'a str,
}

impl Chunker {
  pub fn new(config: &ChunkingConfig) -> Self {
    Self::with_limits(config.max_lines, config.overlap)
  }

  pub fn with_limits(max_lines: usize, overlap: usize) -> Self {
    let max_lines = max_lines.max(1);
    Self {
      max_lines,
      overlap: overlap.min(max_lines - 1),
    }
  }

  /// Chunk one file into an ordered sequence (ascending start line).
  pub fn chunk_file(&self, relative_path: &str, content: &str) -> Vec<Chunk> {
    if content.trim().is_empty() {
      return Vec::new();
    }

    let ext = Path::new(relative_path)
      .extension()
      .and_then(|e| e.to_str())
      .unwrap_or("");
    let language = canonical_language(ext);

    if ast_supported(ext) {
      match self.ast_chunks(relative_path, content, ext, &language) {
        Some(chunks) if !chunks.is_empty() => return chunks,
        _ => {
          debug!(file = %relative_path, "AST chunking unavailable, falling back to line strategy");
        }
      }
    }

    self.line_chunks(relative_path, content, &language)
  }

  // === AST strategy ===

  fn ast_chunks(&self, path: &str, content: &str, ext: &str, language: &str) -> Option<Vec<Chunk>> {
    let spec = languages::spec_for_extension(ext)?;
    let mut parser = Parser::new();
    parser.set_language(&spec.grammar).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();
    if root.has_error() {
      return None;
    }

    let lines: Vec<&str> = content.lines().collect();
    let ctx = AstContext {
      spec: &spec,
      path,
      language,
      lines: &lines,
      source: content,
    };

    let mut chunks = Vec::new();
    let mut imports: Vec<(u32, u32)> = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
      self.visit_top_level(&ctx, child, &mut imports, &mut chunks);
    }

    // Imports coalesce into a single leading chunk spanning first..last
    if let (Some(&(first, _)), Some(&(_, last))) = (imports.first(), imports.last()) {
      let end = imports.iter().map(|&(_, e)| e).max().unwrap_or(last);
      if let Some(chunk) = self.range_chunk(&ctx, first, end, Some(SymbolKind::Import), None) {
        chunks.push(chunk);
      }
    }

    if chunks.is_empty() {
      return None;
    }

    let mut sized = Vec::new();
    for chunk in chunks {
      sized.extend(self.split_oversized(chunk));
    }
    sized.sort_by_key(|c| (c.start_line, c.end_line));
    Some(sized)
  }

  fn visit_top_level(&self, ctx: &AstContext, node: Node, imports: &mut Vec<(u32, u32)>, chunks: &mut Vec<Chunk>) {
    let kind = node.kind();

    if ctx.spec.wrappers.contains(&kind) {
      let mut cursor = node.walk();
      for child in node.named_children(&mut cursor) {
        self.visit_wrapped(ctx, node, child, imports, chunks);
      }
      return;
    }

    if ctx.spec.imports.contains(&kind) {
      imports.push(node_lines(node));
      return;
    }

    if ctx.spec.functions.contains(&kind) {
      self.push_symbol(ctx, node, node, SymbolKind::Function, chunks);
      return;
    }

    if ctx.spec.top_level_methods.contains(&kind) {
      self.push_symbol(ctx, node, node, SymbolKind::Method, chunks);
      return;
    }

    if ctx.spec.classes.contains(&kind) {
      self.class_chunks(ctx, node, node, chunks);
      return;
    }

    if ctx.spec.interfaces.contains(&kind) {
      self.push_symbol(ctx, node, node, SymbolKind::Interface, chunks);
      return;
    }

    if ctx.spec.types.contains(&kind) {
      self.type_chunks(ctx, node, imports, chunks);
      return;
    }

    if ctx.spec.variables.contains(&kind) {
      self.push_symbol(ctx, node, node, SymbolKind::Variable, chunks);
    }
  }

  /// Handle a declaration inside a wrapper node: the chunk spans the wrapper
  /// (so `export` keywords and decorators stay attached) while classification
  /// and naming come from the inner declaration.
  fn visit_wrapped(
    &self,
    ctx: &AstContext,
    wrapper: Node,
    inner: Node,
    imports: &mut Vec<(u32, u32)>,
    chunks: &mut Vec<Chunk>,
  ) {
    let kind = inner.kind();

    if ctx.spec.imports.contains(&kind) {
      imports.push(node_lines(wrapper));
      return;
    }
    if ctx.spec.functions.contains(&kind) {
      self.push_symbol(ctx, wrapper, inner, SymbolKind::Function, chunks);
      return;
    }
    if ctx.spec.classes.contains(&kind) {
      self.class_chunks(ctx, wrapper, inner, chunks);
      return;
    }
    if ctx.spec.interfaces.contains(&kind) {
      self.push_symbol(ctx, wrapper, inner, SymbolKind::Interface, chunks);
      return;
    }
    if ctx.spec.types.contains(&kind) {
      self.push_symbol(ctx, wrapper, inner, SymbolKind::Type, chunks);
      return;
    }
    if ctx.spec.variables.contains(&kind) {
      self.push_symbol(ctx, wrapper, inner, SymbolKind::Variable, chunks);
    }
  }

  fn push_symbol(&self, ctx: &AstContext, span: Node, named: Node, kind: SymbolKind, chunks: &mut Vec<Chunk>) {
    let (start, end) = node_lines(span);
    let name = node_name(named, ctx.source);
    if let Some(chunk) = self.range_chunk(ctx, start, end, Some(kind), name) {
      chunks.push(chunk);
    }
  }

  /// Classes within budget chunk whole; oversized ones become a header chunk
  /// plus one chunk per method named `Class.method`.
  fn class_chunks(&self, ctx: &AstContext, span: Node, class_node: Node, chunks: &mut Vec<Chunk>) {
    let (start, end) = node_lines(span);
    let class_name = node_name(class_node, ctx.source);

    if (end - start + 1) as usize <= self.max_lines {
      if let Some(chunk) = self.range_chunk(ctx, start, end, Some(SymbolKind::Class), class_name) {
        chunks.push(chunk);
      }
      return;
    }

    let methods = find_methods(ctx.spec, class_node);
    if methods.is_empty() {
      // No methods to split on; the even-split pass bounds it instead
      if let Some(chunk) = self.range_chunk(ctx, start, end, Some(SymbolKind::Class), class_name) {
        chunks.push(chunk);
      }
      return;
    }

    let first_method_start = node_lines(methods[0]).0;
    if first_method_start > start
      && let Some(header) = self.range_chunk(
        ctx,
        start,
        first_method_start - 1,
        Some(SymbolKind::Class),
        class_name.clone(),
      )
    {
      chunks.push(header);
    }

    for method in methods {
      let (m_start, m_end) = node_lines(method);
      let method_name = node_name(method, ctx.source);
      let qualified = match (&class_name, method_name) {
        (Some(class), Some(name)) => Some(format!("{}.{}", class, name)),
        (None, Some(name)) => Some(name),
        _ => None,
      };
      if let Some(chunk) = self.range_chunk(ctx, m_start, m_end, Some(SymbolKind::Method), qualified) {
        chunks.push(chunk);
      }
    }
  }

  /// Types within budget chunk whole; oversized ones are descended into so
  /// nested declarations produce their own chunks.
  fn type_chunks(&self, ctx: &AstContext, node: Node, imports: &mut Vec<(u32, u32)>, chunks: &mut Vec<Chunk>) {
    let (start, end) = node_lines(node);
    let name = node_name(node, ctx.source);

    if (end - start + 1) as usize <= self.max_lines {
      if let Some(chunk) = self.range_chunk(ctx, start, end, Some(SymbolKind::Type), name) {
        chunks.push(chunk);
      }
      return;
    }

    let before = chunks.len();
    let scope = node.child_by_field_name("body").unwrap_or(node);
    let mut cursor = scope.walk();
    for child in scope.named_children(&mut cursor) {
      self.visit_top_level(ctx, child, imports, chunks);
    }

    if chunks.len() == before
      && let Some(chunk) = self.range_chunk(ctx, start, end, Some(SymbolKind::Type), name)
    {
      chunks.push(chunk);
    }
  }

  fn range_chunk(
    &self,
    ctx: &AstContext,
    start_line: u32,
    end_line: u32,
    kind: Option<SymbolKind>,
    name: Option<String>,
  ) -> Option<Chunk> {
    let start = (start_line as usize - 1).min(ctx.lines.len());
    let end = (end_line as usize).min(ctx.lines.len());
    if start >= end {
      return None;
    }

    let content = ctx.lines[start..end].join("\n");
    if content.trim().is_empty() {
      return None;
    }

    let mut chunk = Chunk::new(ctx.path, content, start_line, end as u32, ctx.language);
    match (kind, name) {
      (Some(kind), Some(name)) => chunk = chunk.with_symbol(kind, name),
      (Some(kind), None) => chunk.symbol_kind = Some(kind),
      _ => {}
    }
    Some(chunk)
  }

  /// Sub-divide any chunk exceeding max_lines into roughly equal parts of
  /// size `ceil(total / ceil(total / max_lines))`; a trailing part smaller
  /// than MIN_LINES merges into the preceding one.
  fn split_oversized(&self, chunk: Chunk) -> Vec<Chunk> {
    let total = chunk.line_count() as usize;
    if total <= self.max_lines {
      return vec![chunk];
    }

    let lines: Vec<&str> = chunk.content.lines().collect();
    let part_count = total.div_ceil(self.max_lines);
    let part_size = total.div_ceil(part_count);

    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    while start < total {
      let end = (start + part_size).min(total);
      bounds.push((start, end));
      start = end;
    }
    if bounds.len() > 1
      && let Some(&(last_start, last_end)) = bounds.last()
      && last_end - last_start < MIN_LINES
    {
      bounds.pop();
      if let Some(prev) = bounds.last_mut() {
        prev.1 = total;
      }
    }

    let mut parts = Vec::with_capacity(bounds.len());
    for (offset_start, offset_end) in bounds {
      let content = lines[offset_start..offset_end].join("\n");
      if content.trim().is_empty() {
        continue;
      }
      let start_line = chunk.start_line + offset_start as u32;
      let end_line = chunk.start_line + offset_end as u32 - 1;
      let mut part = Chunk::new(chunk.filepath.clone(), content, start_line, end_line, chunk.language.clone());
      match (chunk.symbol_kind, &chunk.symbol_name) {
        (Some(kind), Some(name)) => part = part.with_symbol(kind, name.clone()),
        (Some(kind), None) => part.symbol_kind = Some(kind),
        _ => {}
      }
      parts.push(part);
    }
    parts
  }

  // === Line strategy ===

  /// Sliding window of max_lines with overlap; windows whose trimmed content
  /// is empty are skipped.
  fn line_chunks(&self, path: &str, content: &str, language: &str) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let step = self.max_lines - self.overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
      let end = (start + self.max_lines).min(total);
      let window = lines[start..end].join("\n");
      if !window.trim().is_empty() {
        chunks.push(Chunk::new(path, window, (start + 1) as u32, end as u32, language));
      }
      if end >= total {
        break;
      }
      start += step;
    }
    chunks
  }
}

fn node_lines(node: Node) -> (u32, u32) {
  (
    node.start_position().row as u32 + 1,
    node.end_position().row as u32 + 1,
  )
}

/// Resolve the declared name of a node: its own name/type field, or a
/// one-level descent for declarations that wrap a named item (go type_spec,
/// js variable_declarator, decorated definitions).
fn node_name(node: Node, source: &str) -> Option<String> {
  for field in ["name", "type"] {
    if let Some(name_node) = node.child_by_field_name(field) {
      return name_node.utf8_text(source.as_bytes()).ok().map(str::to_string);
    }
  }

  let mut cursor = node.walk();
  for child in node.named_children(&mut cursor) {
    if let Some(name_node) = child.child_by_field_name("name") {
      return name_node.utf8_text(source.as_bytes()).ok().map(str::to_string);
    }
  }
  None
}

/// Method nodes directly inside a class body, in source order.
fn find_methods<'t>(spec: &LanguageSpec, class_node: Node<'t>) -> Vec<Node<'t>> {
  let body = class_node.child_by_field_name("body").or_else(|| {
    let mut cursor = class_node.walk();
    class_node
      .named_children(&mut cursor)
      .find(|c| matches!(c.kind(), "body_statement" | "declaration_list" | "class_body" | "block"))
  });
  let Some(body) = body else {
    return Vec::new();
  };

  let mut methods = Vec::new();
  let mut cursor = body.walk();
  for child in body.named_children(&mut cursor) {
    if spec.methods.contains(&child.kind()) {
      methods.push(child);
      continue;
    }
    if spec.wrappers.contains(&child.kind()) {
      let mut inner_cursor = child.walk();
      let wraps_method = child
        .named_children(&mut inner_cursor)
        .any(|inner| spec.methods.contains(&inner.kind()));
      if wraps_method {
        methods.push(child);
      }
    }
  }
  methods
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn test_empty_file_produces_zero_chunks() {
    let chunker = Chunker::default();
    assert!(chunker.chunk_file("empty.py", "").is_empty());
    assert!(chunker.chunk_file("blank.py", "   \n\n  \n").is_empty());
  }

  #[test]
  fn test_single_function_file() {
    let chunks = Chunker::default().chunk_file("a.py", "def f(): pass\n");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].language, "python");
    assert_eq!(chunks[0].symbol_name.as_deref(), Some("f"));
    assert_eq!(chunks[0].symbol_kind, Some(SymbolKind::Function));
    assert_eq!(chunks[0].id, "a.py:1-1:f");
  }

  #[test]
  fn test_output_sorted_by_start_line() {
    let source = r#"import os

def beta():
    pass

def alpha():
    pass
"#;
    let chunks = Chunker::default().chunk_file("mod.py", source);
    let starts: Vec<u32> = chunks.iter().map(|c| c.start_line).collect();
    let mut sorted = starts.clone();
    sorted.sort();
    assert_eq!(starts, sorted);
    assert_eq!(chunks[0].symbol_kind, Some(SymbolKind::Import), "import chunk leads");
  }

  #[test]
  fn test_parse_failure_falls_back_to_lines() {
    // Unbalanced braces force an ERROR node
    let source = "def broken(:\n    pass\nmore garbage }{\n";
    let chunks = Chunker::default().chunk_file("broken.py", source);
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.symbol_kind.is_none()), "line chunks carry no symbols");
  }

  #[test]
  fn test_unsupported_extension_uses_line_strategy() {
    let source = "# Title\n\nSome prose here.\n";
    let chunks = Chunker::default().chunk_file("README.md", source);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].language, "markdown");
    assert_eq!(chunks[0].start_line, 1);
    assert_eq!(chunks[0].end_line, 3);
  }

  #[test]
  fn test_line_windows_overlap() {
    let source = (1..=25).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
    let chunker = Chunker::with_limits(10, 2);
    let chunks = chunker.chunk_file("data.txt", &source);

    assert_eq!(chunks[0].start_line, 1);
    assert_eq!(chunks[0].end_line, 10);
    // Next window starts overlap lines before the previous end
    assert_eq!(chunks[1].start_line, 9);
    assert_eq!(chunks[1].end_line, 18);
    assert_eq!(chunks[2].start_line, 17);
    assert_eq!(chunks[2].end_line, 25);
  }

  #[test]
  fn test_blank_windows_skipped() {
    let mut source = String::from("text\n");
    source.push_str(&"\n".repeat(30));
    let chunker = Chunker::with_limits(10, 0);
    let chunks = chunker.chunk_file("sparse.txt", &source);
    assert_eq!(chunks.len(), 1, "all-blank windows are dropped: {:?}", chunks);
  }

  #[test]
  fn test_split_sizes_are_roughly_equal() {
    // A 250-line chunk with max 100 splits into ceil(250/3)=84-line parts
    let content = (1..=250).map(|i| format!("l{}", i)).collect::<Vec<_>>().join("\n");
    let chunk = Chunk::new("big.txt", content, 1, 250, "text");

    let chunker = Chunker::with_limits(100, 20);
    let parts = chunker.split_oversized(chunk);

    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].line_count(), 84);
    assert_eq!(parts[1].line_count(), 84);
    assert_eq!(parts[2].line_count(), 82);
    assert_eq!(parts[0].start_line, 1);
    assert_eq!(parts[1].start_line, 85);
    assert_eq!(parts[2].end_line, 250);
  }

  #[test]
  fn test_split_merges_tiny_tail() {
    // 10 lines with max 4: ceil(10/4)=3 parts of ceil(10/3)=4 -> 4,4,2.
    // The 2-line tail is below the 3-line minimum and merges: 4,6.
    let content = (1..=10).map(|i| format!("l{}", i)).collect::<Vec<_>>().join("\n");
    let chunk = Chunk::new("tail.txt", content, 1, 10, "text");

    let chunker = Chunker::with_limits(4, 0);
    let parts = chunker.split_oversized(chunk);
    assert_eq!(parts.iter().map(|p| p.line_count()).collect::<Vec<_>>(), vec![4, 6]);
    assert_eq!(parts[1].start_line, 5);
    assert_eq!(parts[1].end_line, 10);

    // 43 lines with max 21: ceil(43/21)=3 parts of ceil(43/3)=15 -> 15,15,13
    let content = (1..=43).map(|i| format!("l{}", i)).collect::<Vec<_>>().join("\n");
    let chunk = Chunk::new("tail.txt", content, 1, 43, "text");
    let chunker = Chunker::with_limits(21, 0);
    let parts = chunker.split_oversized(chunk);
    assert_eq!(parts.iter().map(|p| p.line_count()).collect::<Vec<_>>(), vec![15, 15, 13]);
  }

  #[test]
  fn test_oversized_function_split_preserves_symbol() {
    let mut source = String::from("def long_one():\n");
    for i in 0..150 {
      source.push_str(&format!("    x{} = {}\n", i, i));
    }
    let chunks = Chunker::with_limits(100, 20).chunk_file("long.py", &source);

    assert!(chunks.len() >= 2, "oversized function splits: {}", chunks.len());
    for chunk in &chunks {
      assert!(chunk.line_count() as usize <= 100);
      assert_eq!(chunk.symbol_name.as_deref(), Some("long_one"));
    }
    // Ranges differ so ids stay unique
    let ids: std::collections::HashSet<_> = chunks.iter().map(|c| &c.id).collect();
    assert_eq!(ids.len(), chunks.len());
  }

  #[test]
  fn test_ast_with_no_symbols_falls_back() {
    // Valid python that defines nothing
    let source = "print(\"hello\")\nprint(\"world\")\n";
    let chunks = Chunker::default().chunk_file("script.py", source);
    assert_eq!(chunks.len(), 1, "line fallback still captures content");
    assert!(chunks[0].symbol_kind.is_none());
  }
}
