//! Per-language node-kind tables for the AST chunking strategy.
//!
//! Each grammar contributes a [`LanguageSpec`] naming the tree-sitter node
//! kinds that represent imports, functions, classes, interfaces, types, and
//! variables, plus the method kinds found inside class bodies.

use tree_sitter::Language as Grammar;

mod go;
mod java;
mod python;
mod ruby;
mod rust;
mod typescript;

pub struct LanguageSpec {
  pub grammar: Grammar,
  /// Transparent wrappers to descend through (export statements, decorators)
  pub wrappers: &'static [&'static str],
  pub imports: &'static [&'static str],
  pub functions: &'static [&'static str],
  /// Top-level methods outside any class body (Go receiver methods)
  pub top_level_methods: &'static [&'static str],
  pub classes: &'static [&'static str],
  pub interfaces: &'static [&'static str],
  pub types: &'static [&'static str],
  pub variables: &'static [&'static str],
  /// Method node kinds inside class bodies
  pub methods: &'static [&'static str],
}

pub fn spec_for_extension(ext: &str) -> Option<LanguageSpec> {
  match ext {
    "rs" => Some(rust::spec()),
    "py" => Some(python::spec()),
    "go" => Some(go::spec()),
    "java" => Some(java::spec()),
    "rb" => Some(ruby::spec()),
    "ts" => Some(typescript::spec_typescript()),
    "tsx" => Some(typescript::spec_tsx()),
    "js" | "jsx" => Some(typescript::spec_javascript()),
    _ => None,
  }
}
