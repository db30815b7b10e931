//! Rust node-kind tables
//!
//! Impl blocks act as the "class" shape so oversized ones split into
//! per-method chunks named `Type.method`.

use super::LanguageSpec;

pub fn spec() -> LanguageSpec {
  LanguageSpec {
    grammar: tree_sitter_rust::LANGUAGE.into(),
    wrappers: &[],
    imports: &["use_declaration", "extern_crate_declaration"],
    functions: &["function_item"],
    top_level_methods: &[],
    classes: &["impl_item"],
    interfaces: &["trait_item"],
    types: &["struct_item", "enum_item", "type_item", "union_item", "mod_item"],
    variables: &["const_item", "static_item"],
    methods: &["function_item"],
  }
}

#[cfg(test)]
mod tests {
  use codectx_core::SymbolKind;

  use crate::Chunker;

  #[test]
  fn test_rust_top_level_symbols() {
    let source = r#"use std::fmt;

pub fn standalone() -> i32 {
    42
}

pub struct Config {
    pub value: i32,
}

pub trait Renderer {
    fn render(&self) -> String;
}

const LIMIT: usize = 10;
"#;
    let chunks = Chunker::default().chunk_file("src/lib.rs", source);

    let kinds: Vec<_> = chunks.iter().filter_map(|c| c.symbol_kind).collect();
    assert!(kinds.contains(&SymbolKind::Import), "chunks: {:?}", chunks);
    assert!(kinds.contains(&SymbolKind::Function));
    assert!(kinds.contains(&SymbolKind::Type));
    assert!(kinds.contains(&SymbolKind::Interface));
    assert!(kinds.contains(&SymbolKind::Variable));

    let func = chunks.iter().find(|c| c.symbol_kind == Some(SymbolKind::Function)).unwrap();
    assert_eq!(func.symbol_name.as_deref(), Some("standalone"));
    assert_eq!(func.language, "rust");
  }

  #[test]
  fn test_rust_impl_block_is_class_shaped() {
    let source = r#"struct Point;

impl Point {
    fn x(&self) -> i32 { 0 }
}
"#;
    let chunks = Chunker::default().chunk_file("src/point.rs", source);
    let class = chunks.iter().find(|c| c.symbol_kind == Some(SymbolKind::Class)).unwrap();
    assert_eq!(class.symbol_name.as_deref(), Some("Point"));
  }

  #[test]
  fn test_rust_oversized_impl_splits_into_methods() {
    let mut source = String::from("struct Big;\n\nimpl Big {\n");
    for i in 0..30 {
      source.push_str(&format!("  fn method{}(&self) -> i32 {{\n", i));
      for _ in 0..3 {
        source.push_str("    // work\n");
      }
      source.push_str("    0\n  }\n");
    }
    source.push_str("}\n");

    let chunker = Chunker::with_limits(100, 20);
    let chunks = chunker.chunk_file("src/big.rs", &source);

    let methods: Vec<_> = chunks
      .iter()
      .filter(|c| c.symbol_kind == Some(SymbolKind::Method))
      .collect();
    assert!(!methods.is_empty(), "oversized impl should split into methods");
    assert!(
      methods.iter().any(|c| c.symbol_name.as_deref() == Some("Big.method0")),
      "methods: {:?}",
      methods.iter().map(|c| &c.symbol_name).collect::<Vec<_>>()
    );
  }
}
